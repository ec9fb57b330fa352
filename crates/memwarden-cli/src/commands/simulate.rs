use chrono::{TimeDelta, Utc};
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memwarden::{Config, Engine};
use std::path::PathBuf;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_size, format_timestamp, truncate_string};
use crate::scenario::Scenario;

#[derive(Parser)]
pub struct SimulateCommand {
    #[clap(help = "Path to a scenario TOML file")]
    pub scenario: PathBuf,

    #[clap(long, short, help = "Apply memory pressure asking for this many bytes")]
    pub needed: Option<u64>,

    #[clap(
        long,
        help = "Run an expiry sweep this many seconds after registration"
    )]
    pub advance_secs: Option<u64>,

    #[clap(long, short, default_value = "20", help = "Maximum number of release events to display")]
    pub limit: usize,
}

impl SimulateCommand {
    /// Register the scenario in a fresh engine, then apply pressure and an
    /// expiry sweep. Payloads are placeholders sized only by their metadata.
    pub fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        let scenario = Scenario::load(&self.scenario)?;
        let engine = Engine::new(config.clone())?;
        let tracker = engine.tracker();

        for resource in &scenario.resources {
            tracker.register(&resource.id, resource.id.clone(), &resource.type_name, resource.size_bytes)?;
        }
        let mut usage = Vec::new();
        for resource in scenario.resources.iter().filter(|r| r.active) {
            usage.push(tracker.acquire(&resource.id)?);
        }

        let pressure_count = self.needed.map(|needed| tracker.release_by_pressure(needed));
        let expired_count = self.advance_secs.map(|secs| {
            let secs = secs.min(i64::MAX as u64) as i64;
            tracker.sweep_expired_at(Utc::now() + TimeDelta::seconds(secs))
        });
        drop(usage);

        let stats = tracker.stats();
        let release_stats = tracker.release_stats();
        let events = tracker.recent_events(self.limit);
        let snapshots = engine.snapshots().list();

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "pressure_released": pressure_count,
                    "expired_released": expired_count,
                    "remaining": stats,
                    "release_stats": release_stats,
                    "events": events,
                    "snapshots": snapshots,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Simulation Results");
                println!("==================\n");

                if let Some(count) = pressure_count {
                    println!("Pressure: {count} resources released");
                }
                if let Some(count) = expired_count {
                    println!("Expiry sweep: {count} resources released");
                }
                println!(
                    "Remaining: {} resources ({}), {} released ({})\n",
                    stats.count,
                    format_size(stats.total_bytes),
                    release_stats.release_count,
                    format_size(release_stats.total_released_bytes)
                );

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Resource", "Kind", "Cause", "Freed", "Snapshot", "At"]);

                for event in &events {
                    table.add_row([
                        truncate_string(&event.resource_id, 40),
                        format!("{:?}", event.kind),
                        format!("{:?}", event.cause),
                        format_size(event.freed_bytes),
                        if event.snapshot_taken { "yes" } else { "no" }.to_string(),
                        format_timestamp(&event.released_at),
                    ]);
                }
                println!("{table}\n");

                if !snapshots.is_empty() {
                    println!("{} snapshots available for rollback", snapshots.len());
                }
            }
        }

        Ok(())
    }
}
