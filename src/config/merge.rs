use std::path::PathBuf;

use super::{Config, ConfigLayer};

pub fn merge_layers(user: Option<ConfigLayer>, explicit: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = explicit {
        layer.apply_to(&mut config);
    }
    config
}

/// Apply `ENDO_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `ENDO_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| -> Option<String> {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = read("ENDO_STATE_PATH") {
        config.paths.state = Some(PathBuf::from(raw));
    }
    if let Some(raw) = read("ENDO_EPHEMERAL_STATE_PATH") {
        config.paths.ephemeral_state = Some(PathBuf::from(raw));
    }
    if let Some(raw) = read("ENDO_CACHE_PATH") {
        config.paths.cache = Some(PathBuf::from(raw));
    }
    if let Some(raw) = read("ENDO_SOCK_PATH") {
        config.paths.sock = Some(PathBuf::from(raw));
    }
    if let Some(raw) = read("ENDO_WORKER_PATH") {
        config.worker.program = Some(PathBuf::from(raw));
    }

    if let Some(raw) = read("ENDO_GRACE_PERIOD_MS") {
        match raw.parse::<u64>() {
            Ok(value) => {
                config.grace_period_ms = value;
            }
            Err(err) => {
                tracing::warn!("invalid ENDO_GRACE_PERIOD_MS, ignoring: {err}");
            }
        }
    }

    if let Some(raw) = read("ENDO_LISTEN_ADDR") {
        match raw.parse::<std::net::SocketAddr>() {
            Ok(_) => {
                config.network.listen_addr = Some(raw);
            }
            Err(err) => {
                tracing::warn!("invalid ENDO_LISTEN_ADDR, ignoring: {err}");
            }
        }
    }
}
