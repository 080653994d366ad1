pub mod catalog;
pub mod cleanup;
pub mod launch;
pub mod process;
pub mod runner;
pub mod sync;

pub use catalog::{Catalog, CatalogError};
pub use cleanup::{CleanupReport, NodeCleanup, DEFAULT_PATTERNS};
pub use launch::{LaunchPlan, LaunchSettings};
pub use process::{run_with_deadline, ProcessOutcome};
pub use runner::{default_report_path, BenchmarkRunner, RunnerOptions};
pub use sync::{sync_binaries, SyncOutcome, SyncReport};
