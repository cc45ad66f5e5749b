//! Building one runner per node from shared credentials

use crate::config::RunnerConfig;
use crate::registry::ControlRegistry;
use crate::runner::{CommandRunner, ConnectionIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Credentials shared by every node of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCredentials {
    /// Remote user
    pub user: String,
    /// Private key
    pub key_path: PathBuf,
    /// Multiplexing identifier, usually the cluster name
    pub control_name: Option<String>,
    /// Remote port
    pub port: u16,
}

impl NodeCredentials {
    /// Credentials on port 22 with no multiplexing
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            control_name: None,
            port: 22,
        }
    }

    /// Share one control channel per node under `name`
    pub fn with_control_name(mut self, name: impl Into<String>) -> Self {
        self.control_name = Some(name.into());
        self
    }

    /// Set the remote port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Creates runners that share a configuration and control registry
#[derive(Debug, Clone)]
pub struct RunnerFactory {
    config: Arc<RunnerConfig>,
    registry: ControlRegistry,
}

impl Default for RunnerFactory {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl RunnerFactory {
    /// Factory using `config` and the global registry
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: ControlRegistry::global(),
        }
    }

    /// Use `registry` instead of the global one
    pub fn with_registry(mut self, registry: ControlRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Shared registry
    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    /// Shared configuration
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// One runner per address, in input order. No connection is opened.
    pub fn make_runners<S: AsRef<str>>(
        &self,
        addresses: &[S],
        credentials: &NodeCredentials,
    ) -> Vec<CommandRunner> {
        debug!("Creating {} runners", addresses.len());
        addresses
            .iter()
            .map(|address| {
                let identity = ConnectionIdentity {
                    address: address.as_ref().to_string(),
                    user: credentials.user.clone(),
                    key_path: credentials.key_path.clone(),
                    control_name: credentials.control_name.clone(),
                    port: credentials.port,
                };
                CommandRunner::from_identity(identity, self.config.clone(), self.registry.clone())
            })
            .collect()
    }
}

/// One runner per address with default configuration
pub fn make_runners<S: AsRef<str>>(addresses: &[S], credentials: &NodeCredentials) -> Vec<CommandRunner> {
    RunnerFactory::default().make_runners(addresses, credentials)
}
