//! Shared error and result types for the TLS page manager.

pub mod error;

pub use error::{HostOp, SysResult, TlsError, abort_on_host_failure};
