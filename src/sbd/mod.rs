//! The per-host execution daemon.

pub mod child;
pub mod daemon;
pub mod executor;
pub mod handler;
pub mod link;
pub mod reaper;

pub use child::ChildProcessRunner;
pub use daemon::SbdDaemon;
pub use executor::JobExecutor;
pub use link::{MbdLink, MbdSink};
