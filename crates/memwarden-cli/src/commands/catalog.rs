use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memwarden::{Config, TypeCatalog};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct CatalogCommand {
    #[clap(long, help = "Also print engine tunables")]
    pub verbose: bool,
}

impl CatalogCommand {
    pub fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        let catalog = TypeCatalog::new(config.types.clone())?;
        let threshold = config.snapshots.priority_threshold;

        match format {
            OutputFormat::Json => {
                let types: Vec<_> = catalog
                    .descriptors()
                    .into_iter()
                    .map(|d| {
                        serde_json::json!({
                            "type_name": d.type_name,
                            "priority": d.priority,
                            "max_retain_seconds": d.max_retain_seconds,
                            "compressible": d.compressible,
                            "incrementally_releasable": d.incrementally_releasable,
                            "snapshot_before_release": d.priority < threshold,
                        })
                    })
                    .collect();
                let mut output = serde_json::json!({ "types": types });
                if self.verbose {
                    output["tunables"] = serde_json::json!({
                        "lock_timeout_secs": config.locks.timeout_secs,
                        "snapshot_priority_threshold": threshold,
                        "snapshot_ttl_secs": config.snapshots.ttl_secs,
                        "incremental_pressure_ratio": config.tracker.incremental_pressure_ratio,
                        "incremental_fraction": config.tracker.incremental_fraction,
                        "defrag_threshold_bytes": config.defrag.release_threshold_bytes,
                    });
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Resource Types");
                println!("==============\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header([
                        "Type",
                        "Priority",
                        "Max Retain",
                        "Compressible",
                        "Incremental",
                        "Snapshot",
                    ]);

                for d in catalog.descriptors() {
                    table.add_row([
                        d.type_name.clone(),
                        d.priority.to_string(),
                        format!("{}s", d.max_retain_seconds),
                        yes_no(d.compressible).to_string(),
                        yes_no(d.incrementally_releasable).to_string(),
                        yes_no(d.priority < threshold).to_string(),
                    ]);
                }
                println!("{table}\n");

                if self.verbose {
                    println!("Lock timeout:          {}s", config.locks.timeout_secs);
                    println!("Snapshot threshold:    priority < {threshold}");
                    println!("Snapshot TTL:          {}s", config.snapshots.ttl_secs);
                    println!(
                        "Incremental cutoff:    {:.0}% of tracked bytes",
                        config.tracker.incremental_pressure_ratio * 100.0
                    );
                    println!(
                        "Defrag threshold:      {}",
                        crate::output::format_size(config.defrag.release_threshold_bytes)
                    );
                }
            }
        }

        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
