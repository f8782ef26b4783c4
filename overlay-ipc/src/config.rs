//! Runtime configuration shared by both sides of a connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ipc::shmem::{ShmError, ShmPath};

/// Protocol version of this build. Peers must match exactly.
pub const LAYER_BINARY_VERSION: u32 = 1;

/// Names, timeouts and retry bounds.
///
/// Every field has a default, so a partial configuration deserializes.
/// Durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix of every shared object name. Processes only find each other
    /// within the same namespace.
    pub namespace: String,
    /// Bound on acquiring the negotiation mutex per attempt.
    pub mutex_wait_millis: u64,
    /// Bound on waiting for the other side during negotiation.
    pub negotiation_wait_millis: u64,
    /// Negotiation attempts before giving up.
    pub max_attempts: u32,
    /// Version announced during negotiation.
    pub layer_binary_version: u32,
    /// Slice of each RPC wait between peer liveness checks.
    pub rpc_poll_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "xr-overlay".to_string(),
            mutex_wait_millis: 500,
            negotiation_wait_millis: 500,
            max_attempts: 10,
            layer_binary_version: LAYER_BINARY_VERSION,
            rpc_poll_millis: 100,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mutex_wait(&self) -> Duration {
        Duration::from_millis(self.mutex_wait_millis)
    }

    #[must_use]
    pub fn negotiation_wait(&self) -> Duration {
        Duration::from_millis(self.negotiation_wait_millis)
    }

    #[must_use]
    pub fn rpc_poll(&self) -> Duration {
        Duration::from_millis(self.rpc_poll_millis)
    }

    /// `/{namespace}-{suffix}` as a validated shared memory name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] when the namespace contains `/` or the name
    /// is too long.
    pub fn object_path(&self, suffix: &str) -> Result<ShmPath, ShmError> {
        ShmPath::new(format!("/{}-{}", self.namespace, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.namespace, "xr-overlay");
        assert_eq!(config.mutex_wait(), Duration::from_millis(500));
        assert_eq!(config.negotiation_wait(), Duration::from_millis(500));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.layer_binary_version, LAYER_BINARY_VERSION);
        assert_eq!(config.rpc_poll(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "namespace": "test-ns", "max_attempts": 3 }"#).unwrap();
        assert_eq!(config.namespace, "test-ns");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.mutex_wait_millis, 500);

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }

    #[test]
    fn test_object_path() {
        let config = Config::with_namespace("ns");
        assert_eq!(config.object_path("negotiation-shmem").unwrap().as_str(), "/ns-negotiation-shmem");
        assert!(Config::with_namespace("a/b").object_path("x").is_err());
    }
}
