//! Operator runtime configuration
//!
//! Tunables are sourced from the environment at startup and may be replaced
//! at runtime when the operator's configuration object changes in-cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

/// Runtime configuration of the operator.
///
/// Every field has a default suitable for in-cluster operation; environment
/// variables prefixed with `CHOP_` override individual settings.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// User the operator connects to ClickHouse as
    pub ch_username: String,
    /// Password for `ch_username`
    pub ch_password: String,
    /// ClickHouse HTTP interface port
    pub ch_http_port: u16,
    /// Wait for a host to disappear from `system.clusters` after it has been
    /// removed from the topology ConfigMap
    pub reconcile_wait_exclude: bool,
    /// Wait for a host to reappear in `system.clusters` after it has been
    /// added back to the topology ConfigMap
    pub reconcile_wait_include: bool,
    /// Tick interval of host membership polls
    pub host_poll_interval: Duration,
    /// Upper bound on a single host membership poll
    pub host_poll_timeout: Duration,
    /// Delay before the worker's first dequeue, giving watch caches time to fill
    pub worker_warmup: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            ch_username: "clickhouse_operator".to_string(),
            ch_password: "clickhouse_operator_password".to_string(),
            ch_http_port: 8123,
            reconcile_wait_exclude: false,
            reconcile_wait_include: false,
            host_poll_interval: Duration::from_secs(5),
            host_poll_timeout: Duration::from_secs(600),
            worker_warmup: Duration::from_secs(10),
        }
    }
}

impl OperatorConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply(&env_settings());
        config
    }

    /// Build a configuration from a settings map, e.g. the data section of
    /// the operator's configuration object. Unknown keys are ignored with a
    /// warning; malformed values keep the previous setting.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        let mut config = Self::from_env();
        config.apply(settings);
        config
    }

    fn apply(&mut self, settings: &BTreeMap<String, String>) {
        for (key, value) in settings {
            match key.as_str() {
                "chUsername" => self.ch_username = value.clone(),
                "chPassword" => self.ch_password = value.clone(),
                "chHttpPort" => parse_into(key, value, &mut self.ch_http_port),
                "reconcileWaitExclude" => {
                    parse_into(key, value, &mut self.reconcile_wait_exclude)
                }
                "reconcileWaitInclude" => {
                    parse_into(key, value, &mut self.reconcile_wait_include)
                }
                "hostPollIntervalSeconds" => {
                    parse_duration_into(key, value, &mut self.host_poll_interval)
                }
                "hostPollTimeoutSeconds" => {
                    parse_duration_into(key, value, &mut self.host_poll_timeout)
                }
                "workerWarmupSeconds" => {
                    parse_duration_into(key, value, &mut self.worker_warmup)
                }
                other => warn!("ignoring unknown operator setting {:?}", other),
            }
        }
    }
}

fn env_settings() -> BTreeMap<String, String> {
    const KEYS: &[(&str, &str)] = &[
        ("CHOP_CH_USERNAME", "chUsername"),
        ("CHOP_CH_PASSWORD", "chPassword"),
        ("CHOP_CH_HTTP_PORT", "chHttpPort"),
        ("CHOP_RECONCILE_WAIT_EXCLUDE", "reconcileWaitExclude"),
        ("CHOP_RECONCILE_WAIT_INCLUDE", "reconcileWaitInclude"),
        ("CHOP_HOST_POLL_INTERVAL", "hostPollIntervalSeconds"),
        ("CHOP_HOST_POLL_TIMEOUT", "hostPollTimeoutSeconds"),
        ("CHOP_WORKER_WARMUP", "workerWarmupSeconds"),
    ];

    KEYS.iter()
        .filter_map(|(env, key)| {
            std::env::var(env).ok().map(|v| (key.to_string(), v))
        })
        .collect()
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("malformed operator setting {}={:?}, keeping previous", key, value),
    }
}

fn parse_duration_into(key: &str, value: &str, slot: &mut Duration) {
    match value.parse::<u64>() {
        Ok(secs) => *slot = Duration::from_secs(secs),
        Err(_) => warn!("malformed operator setting {}={:?}, keeping previous", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = OperatorConfig::default();
        assert_eq!(config.ch_http_port, 8123);
        assert!(!config.reconcile_wait_exclude);
        assert!(!config.reconcile_wait_include);
        assert!(config.host_poll_interval < config.host_poll_timeout);
    }

    #[test]
    fn test_settings_override_defaults() {
        let mut settings = BTreeMap::new();
        settings.insert("chUsername".to_string(), "admin".to_string());
        settings.insert("reconcileWaitExclude".to_string(), "true".to_string());
        settings.insert("hostPollIntervalSeconds".to_string(), "2".to_string());

        let config = OperatorConfig::from_settings(&settings);
        assert_eq!(config.ch_username, "admin");
        assert!(config.reconcile_wait_exclude);
        assert_eq!(config.host_poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_value_keeps_previous() {
        let mut settings = BTreeMap::new();
        settings.insert("chHttpPort".to_string(), "not-a-port".to_string());

        let config = OperatorConfig::from_settings(&settings);
        assert_eq!(config.ch_http_port, 8123);
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let mut settings = BTreeMap::new();
        settings.insert("noSuchSetting".to_string(), "1".to_string());

        let config = OperatorConfig::from_settings(&settings);
        assert_eq!(config, OperatorConfig::from_env());
    }
}
