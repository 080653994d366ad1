pub mod dispatch;
pub mod fanout;
pub mod memory;
pub mod probe;
pub mod session;
pub mod ssh;
pub mod transport;

pub use dispatch::{DispatchOptions, DispatchStrategy, Dispatcher};
pub use fanout::{FanOut, PdshFanOut};
pub use memory::{MemoryCluster, SimNode};
pub use probe::probe_topology;
pub use session::{Credentials, MeshReport, NodeMeshOutcome, Session};
pub use ssh::{remote_path, SshOptions, SshTransport};
pub use transport::{ExecOutput, Transport, TransportError, WriteOptions};
