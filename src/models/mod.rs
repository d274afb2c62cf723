pub mod report;
pub mod trace;

pub use report::{DriverReport, MetricsSnapshot, ReuseSummary, RoundReport};
pub use trace::RequestTrace;
