pub mod benchmark;
pub mod command;
pub mod error;
pub mod node;
pub mod topology;
pub mod util;

pub use benchmark::{BenchmarkConfig, BenchmarkReport, BenchmarkResult, LaunchMode};
pub use command::{CommandStatus, RemoteCommandResult};
pub use error::ClusterError;
pub use node::{Node, OsFamily, PackageManager, Role};
pub use topology::{ClusterTopology, NodeFacts, NodeSpec, TopologyInput};

pub mod telemetry;
