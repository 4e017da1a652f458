pub mod config;
pub mod error;
pub mod job;
pub mod master;
pub mod protocol;
pub mod sbd;
pub mod shutdown;
pub mod store;
