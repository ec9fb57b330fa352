use chrono::Utc;
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memwarden::{Config, ReleasePrioritizer, TypeCatalog};
use std::path::PathBuf;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_size, truncate_string};
use crate::scenario::Scenario;

#[derive(Parser)]
pub struct PlanCommand {
    #[clap(help = "Path to a scenario TOML file")]
    pub scenario: PathBuf,

    #[clap(long, short, help = "Bytes that must be freed; marks the selected prefix")]
    pub needed: Option<u64>,

    #[clap(long, short, help = "Show the full score breakdown for one resource id")]
    pub explain: Option<String>,
}

impl PlanCommand {
    pub fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        let scenario = Scenario::load(&self.scenario)?;
        let catalog = TypeCatalog::new(config.types.clone())?;
        let prioritizer = ReleasePrioritizer::with_weights(config.scoring);
        let now = Utc::now();
        let handles = scenario.handles(now);

        for handle in &handles {
            if !catalog.contains(&handle.type_name) {
                tracing::warn!(resource = %handle.id, type_name = %handle.type_name, "unknown type, left out of the plan");
            }
        }

        let releasable: Vec<_> = handles.iter().filter(|h| h.is_releasable()).cloned().collect();
        let order = prioritizer.rank_at(&handles, &catalog, now);
        let selected = self
            .needed
            .map(|needed| prioritizer.select_for_target_at(&releasable, &catalog, needed, now))
            .unwrap_or_default();
        let selected_bytes: u64 = handles
            .iter()
            .filter(|h| selected.contains(&h.id))
            .map(|h| h.size_bytes)
            .sum();

        let explanations: Vec<_> = order
            .iter()
            .filter_map(|id| prioritizer.explain_at(id, &handles, &catalog, now))
            .collect();

        if let Some(id) = &self.explain {
            let explanation = explanations
                .iter()
                .find(|e| &e.id == id)
                .ok_or_else(|| format!("Resource not in plan: {id}"))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(explanation)?),
                OutputFormat::Table => {
                    println!("{} (position {})", explanation.id, explanation.position + 1);
                    println!("Score: {:.1}", explanation.score.total);
                    for reason in &explanation.reasons {
                        println!("  - {reason}");
                    }
                }
            }
            return Ok(());
        }

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "order": explanations,
                    "needed_bytes": self.needed,
                    "selected": selected,
                    "selected_bytes": selected_bytes,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Release Plan");
                println!("============\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["#", "Resource", "Type", "Size", "Score", "State"]);

                for explanation in &explanations {
                    let Some(handle) = handles.iter().find(|h| h.id == explanation.id) else {
                        continue;
                    };
                    let state = if handle.locked {
                        "locked"
                    } else if handle.active {
                        "in use"
                    } else if selected.contains(&handle.id) {
                        "release"
                    } else {
                        "keep"
                    };
                    table.add_row([
                        (explanation.position + 1).to_string(),
                        truncate_string(&handle.id, 40),
                        handle.type_name.clone(),
                        format_size(handle.size_bytes),
                        format!("{:.1}", explanation.score.total),
                        state.to_string(),
                    ]);
                }
                println!("{table}\n");

                if let Some(needed) = self.needed {
                    println!(
                        "Need {}: {} resources selected ({})",
                        format_size(needed),
                        selected.len(),
                        format_size(selected_bytes)
                    );
                    if selected_bytes < needed {
                        println!("Warning: target cannot be met with releasable resources");
                    }
                } else {
                    println!("Total: {} resources ({})", handles.len(), format_size(scenario.total_bytes()));
                }
            }
        }

        Ok(())
    }
}
