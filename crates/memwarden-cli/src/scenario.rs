//! Scenario files: a list of resources to plan or simulate against.
//!
//! ```toml
//! [[resources]]
//! id = "render_cache:frame_42"
//! type = "render_cache"
//! size_bytes = 50000000
//! idle_secs = 30
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use memwarden::ResourceHandle;
use serde::Deserialize;
use std::path::Path;

use crate::error::CliResult;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub resources: Vec<ScenarioResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioResource {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub size_bytes: u64,
    /// Seconds since last access at planning time
    #[serde(default)]
    pub idle_secs: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub locked: bool,
}

impl Scenario {
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CliResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Handles as they would look at `now`
    pub fn handles(&self, now: DateTime<Utc>) -> Vec<ResourceHandle> {
        self.resources
            .iter()
            .map(|r| {
                let seen = now - TimeDelta::seconds(r.idle_secs.min(i64::MAX as u64) as i64);
                let mut handle = ResourceHandle::new(&r.id, &r.type_name, r.size_bytes, seen);
                handle.active = r.active;
                handle.locked = r.locked;
                handle
            })
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.resources.iter().map(|r| r.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
[[resources]]
id = "render_cache:frame_42"
type = "render_cache"
size_bytes = 50000000
idle_secs = 30

[[resources]]
id = "model_shards:encoder"
type = "model_shards"
size_bytes = 800000000
active = true
"#;

    #[test]
    fn test_parse_defaults() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        assert_eq!(scenario.resources.len(), 2);
        assert_eq!(scenario.resources[0].type_name, "render_cache");
        assert!(!scenario.resources[0].active);
        assert_eq!(scenario.resources[1].idle_secs, 0);
        assert_eq!(scenario.total_bytes(), 850_000_000);
    }

    #[test]
    fn test_handles_backdate_last_access() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let now = Utc::now();
        let handles = scenario.handles(now);
        assert_eq!(handles[0].idle_for(now).as_secs(), 30);
        assert!(handles[1].active);
        assert!(!handles[1].is_releasable());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(Scenario::parse("[[resources]]\nid = \"a:b\"\n").is_err());
    }
}
