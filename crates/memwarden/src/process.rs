//! Process-level memory figures and allocator control

/// Resident set size of the current process, where the platform exposes it.
pub fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "memwarden",
                        error = %err,
                        "failed to read /proc/self/status while sampling rss"
                    );
                }
                return None;
            }
        };
        parse_vm_rss(&status)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Extract `VmRSS` (reported in kB) from `/proc/<pid>/status` text as bytes
pub(crate) fn parse_vm_rss(status: &str) -> Option<u64> {
    let rest = status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("VmRSS:"))?;
    let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
    Some(kb.saturating_mul(1024))
}

/// Ask the allocator to hand free heap pages back to the OS.
///
/// Returns true if memory was actually released. Only glibc supports this;
/// elsewhere it is a no-op.
pub fn trim_allocator() -> bool {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator-internal free lists.
        unsafe { libc::malloc_trim(0) != 0 }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        false
    }
}
