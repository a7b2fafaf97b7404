//! Backend construction from configuration.

use super::{BackendFactory, HostBackend, LocalBackend};
use crate::config::Config;
use crate::remote::{Credentials, RemoteBackend, RemoteTarget};

/// Opens real local and SSH backends.
pub struct SystemBackendFactory {
    config: Config,
    credentials: Credentials,
}

impl SystemBackendFactory {
    /// `password` comes from the environment only; it is never stored in the config file.
    pub fn new(config: Config, password: Option<String>) -> Self {
        let credentials = Credentials::current_user(&config.remote).with_password(password);
        Self {
            config,
            credentials,
        }
    }
}

impl BackendFactory for SystemBackendFactory {
    fn open(&self, host: &str, is_local: bool) -> Box<dyn HostBackend> {
        if is_local {
            return Box::new(LocalBackend::new(host));
        }

        let remote = &self.config.remote;
        let target = RemoteTarget::new(host, remote.port, self.credentials.clone())
            .with_timeout(remote.probe_timeout());
        Box::new(RemoteBackend::new(
            target,
            remote.staging_root.clone(),
            remote.connect_retries,
        ))
    }
}
