//! mbatchd's side of the commit protocol.

pub mod event_log;
pub mod registry;
pub mod session;

pub use event_log::{EventLog, FileEventLog, JobEvent, MemoryEventLog};
pub use registry::{MasterJob, MasterJobRegistry};
pub use session::{MasterSession, SharedRegistry};
