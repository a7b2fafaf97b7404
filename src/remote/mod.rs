//! Remote execution over SSH.
//!
//! A remote host is diagnosed through one SSH session that is opened during
//! the pre-flight probe and reused for every step and file operation of that
//! host. When reading an artifact over the session fails, a separate `scp`
//! process is tried before the artifact is left on the target.

pub mod backend;
pub mod diagnostics;
pub mod executor;
pub mod retry;
pub mod transfer;

pub use backend::RemoteBackend;
pub use diagnostics::diagnose_step_failure;
pub use executor::{Credentials, RemoteSession, RemoteTarget, SSHExecutor};
pub use retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
pub use transfer::SCPTransfer;
