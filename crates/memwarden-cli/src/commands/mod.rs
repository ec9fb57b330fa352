pub mod catalog;
pub mod plan;
pub mod simulate;

pub use catalog::CatalogCommand;
pub use plan::PlanCommand;
pub use simulate::SimulateCommand;
