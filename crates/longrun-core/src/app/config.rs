//! ServiceConfig - サービス全体のデフォルト値
//!
//! 環境変数:
//! - `LONGRUN_CHECKPOINT_POLICY`: NONE / AFTER_EACH_AGENT / AFTER_ROOT_CALL
//! - `LONGRUN_SHUTDOWN_GRACE_MS`: shutdown 時に実行中タスクを待つ時間

use std::time::Duration;

use crate::domain::{CheckpointPolicy, ConfigError};
use crate::impls::file_store::env_millis;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Used when a `TaskConfiguration` carries no policy, and for every
    /// resume without a configuration.
    pub default_checkpoint_policy: CheckpointPolicy,

    pub shutdown_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_checkpoint_policy: CheckpointPolicy::AfterEachAgent,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    pub const ENV_CHECKPOINT_POLICY: &'static str = "LONGRUN_CHECKPOINT_POLICY";
    pub const ENV_SHUTDOWN_GRACE_MS: &'static str = "LONGRUN_SHUTDOWN_GRACE_MS";

    pub fn with_default_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.default_checkpoint_policy = policy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Defaults overridden by whichever variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(Self::ENV_CHECKPOINT_POLICY) {
            config.default_checkpoint_policy = raw
                .parse()
                .map_err(|e| ConfigError::invalid(Self::ENV_CHECKPOINT_POLICY, raw.clone(), e))?;
        }
        if let Some(grace) = env_millis(Self::ENV_SHUTDOWN_GRACE_MS)? {
            config.shutdown_grace = grace;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_checkpoint_after_each_agent() {
        let c = ServiceConfig::default();
        assert_eq!(c.default_checkpoint_policy, CheckpointPolicy::AfterEachAgent);
        assert_eq!(c.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn setters_override() {
        let c = ServiceConfig::default()
            .with_default_checkpoint_policy(CheckpointPolicy::None)
            .with_shutdown_grace(Duration::from_millis(10));
        assert_eq!(c.default_checkpoint_policy, CheckpointPolicy::None);
        assert_eq!(c.shutdown_grace, Duration::from_millis(10));
    }
}
