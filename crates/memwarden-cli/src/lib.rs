pub mod commands;
pub mod error;
pub mod output;
pub mod scenario;

pub use commands::{CatalogCommand, PlanCommand, SimulateCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_size, format_timestamp, truncate_string};
pub use scenario::{Scenario, ScenarioResource};
