use std::time::Duration;

use crate::backoff::Backoff;
use crate::connection::ConnectionPolicy;
use crate::error::{RealtimeError, RealtimeResult};
use crate::protocol::DEFAULT_UPDATE_EVENT;
use crate::reconciler::FieldAliases;
use crate::registry::DEFAULT_DEBOUNCE;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:4000/realtime";
pub const DEFAULT_LOG_FILTER: &str = "info,riptide_sync=debug";

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub url: String,
    pub log_filter: String,
    pub debounce: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub event_capacity: usize,
    /// Event names whose payload is a push update.
    pub update_events: Vec<String>,
    pub field_aliases: FieldAliases,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let policy = ConnectionPolicy::default();
        Self {
            url: DEFAULT_URL.into(),
            log_filter: DEFAULT_LOG_FILTER.into(),
            debounce: DEFAULT_DEBOUNCE,
            connect_timeout: policy.connect_timeout,
            max_retries: policy.max_retries,
            backoff: policy.backoff,
            event_capacity: riptide_channel::DEFAULT_EVENT_CAPACITY,
            update_events: vec![DEFAULT_UPDATE_EVENT.into()],
            field_aliases: FieldAliases::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads every tunable through `lookup`; unset or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let url = lookup("RIPTIDE_URL").unwrap_or(defaults.url);
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);
        let debounce = millis("RIPTIDE_DEBOUNCE_MS", defaults.debounce);
        let connect_timeout = millis("RIPTIDE_CONNECT_TIMEOUT_MS", defaults.connect_timeout);
        let max_retries = lookup("RIPTIDE_MAX_RETRIES")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.max_retries);
        let initial = millis("RIPTIDE_BACKOFF_INITIAL_MS", Duration::from_secs(1));
        let backoff = match lookup("RIPTIDE_BACKOFF")
            .unwrap_or_else(|| "exponential".into())
            .as_str()
        {
            "fixed" => Backoff::Fixed(initial),
            _ => Backoff::Exponential {
                initial,
                max: millis("RIPTIDE_BACKOFF_MAX_MS", Duration::from_secs(30)),
                factor: 2.0,
            },
        };
        let event_capacity = lookup("RIPTIDE_EVENT_CAPACITY")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.event_capacity);
        let update_events = lookup("RIPTIDE_UPDATE_EVENTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.update_events);

        Self {
            url,
            log_filter,
            debounce,
            connect_timeout,
            max_retries,
            backoff,
            event_capacity,
            update_events,
            field_aliases: defaults.field_aliases,
        }
    }

    pub fn with_field_aliases(mut self, aliases: FieldAliases) -> Self {
        self.field_aliases = aliases;
        self
    }

    pub fn validate(&self) -> RealtimeResult<()> {
        if self.max_retries == 0 {
            return Err(RealtimeError::Config("max_retries must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(RealtimeError::Config("event_capacity must be at least 1".into()));
        }
        if self.update_events.is_empty() {
            return Err(RealtimeError::Config(
                "at least one update event name is required".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            connect_timeout: self.connect_timeout,
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RealtimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RealtimeConfig::default());
        assert_eq!(config.debounce, Duration::from_millis(300));
        assert_eq!(config.update_events, vec!["resource_update".to_string()]);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let config = RealtimeConfig::from_lookup(lookup(&[
            ("RIPTIDE_URL", "wss://push.example.com/rt"),
            ("RIPTIDE_DEBOUNCE_MS", "50"),
            ("RIPTIDE_MAX_RETRIES", "not-a-number"),
            ("RIPTIDE_BACKOFF", "fixed"),
            ("RIPTIDE_BACKOFF_INITIAL_MS", "250"),
            ("RIPTIDE_UPDATE_EVENTS", "ticket_update, comment_update,,"),
        ]));
        assert_eq!(config.url, "wss://push.example.com/rt");
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff, Backoff::Fixed(Duration::from_millis(250)));
        assert_eq!(config.update_events, vec!["ticket_update", "comment_update"]);
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let config = RealtimeConfig {
            max_retries: 0,
            ..RealtimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(RealtimeError::Config(_))));

        let config = RealtimeConfig::from_lookup(lookup(&[("RIPTIDE_UPDATE_EVENTS", " , ")]));
        assert!(config.update_events.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = std::env::var("RIPTIDE_CONNECT_TIMEOUT_MS").ok();

        std::env::set_var("RIPTIDE_CONNECT_TIMEOUT_MS", "1500");
        let config = RealtimeConfig::from_env();
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.connection_policy().connect_timeout, Duration::from_millis(1500));

        match original {
            Some(value) => std::env::set_var("RIPTIDE_CONNECT_TIMEOUT_MS", value),
            None => std::env::remove_var("RIPTIDE_CONNECT_TIMEOUT_MS"),
        }
    }
}
