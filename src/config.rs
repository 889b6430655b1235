//! Layered configuration: defaults, overridden by an optional
//! `crewly.toml`, overridden by `CREWLY_*` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-session continuation policy knobs (§4.6 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationPolicy {
    pub enabled: bool,
    pub max_iterations: u32,
    pub auto_assign_next: bool,
    pub notify_on_max_iterations: bool,
    pub notify_on_error: bool,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 10,
            auto_assign_next: false,
            notify_on_max_iterations: true,
            notify_on_error: true,
        }
    }
}

/// Hard ceiling on `max_iterations`, independent of policy overrides.
pub const MAX_ITERATIONS_CEILING: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerDefaults {
    pub base_minutes: f64,
    pub min_minutes: f64,
    pub max_minutes: f64,
    pub adjustment_factor: f64,
}

impl Default for SchedulerDefaults {
    fn default() -> Self {
        Self {
            base_minutes: 15.0,
            min_minutes: 5.0,
            max_minutes: 60.0,
            adjustment_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrewlyConfig {
    /// Override for `~/.crewly`; mirrors `$CREWLY_HOME`.
    pub home: Option<PathBuf>,
    pub continuation: ContinuationPolicy,
    pub scheduler: SchedulerDefaults,
    /// Event Bus debounce window, seconds (§4.4).
    pub debounce_secs: u64,
    /// Event Bus dedup window, seconds (§4.4).
    pub dedup_secs: u64,
    /// Activity Monitor sweep interval, seconds (§4.8).
    pub activity_sweep_secs: u64,
    /// Consecutive idle sweeps before publishing `activity_idle` (§4.8).
    pub idle_consecutive_threshold: u32,
    /// Lines of recent output the Continuation Engine captures per event.
    pub capture_lines: usize,
}

impl Default for CrewlyConfig {
    fn default() -> Self {
        Self {
            home: None,
            continuation: ContinuationPolicy::default(),
            scheduler: SchedulerDefaults::default(),
            debounce_secs: 5,
            dedup_secs: 10,
            activity_sweep_secs: 30,
            idle_consecutive_threshold: 3,
            capture_lines: 100,
        }
    }
}

impl CrewlyConfig {
    /// Load defaults, then an optional `crewly.toml` (next to the binary's
    /// working directory, or the path given by `$CREWLY_CONFIG`), then
    /// `CREWLY_*` environment overrides.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let default_json = serde_json::to_value(&defaults).context("serializing config defaults")?;

        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&default_json).context("loading config defaults")?);

        let config_path = std::env::var("CREWLY_CONFIG").unwrap_or_else(|_| "crewly.toml".to_string());
        if std::path::Path::new(&config_path).exists() {
            builder = builder.add_source(::config::File::with_name(&config_path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("CREWLY")
                .separator("__")
                .try_parsing(true),
        );

        let settled = builder.build().context("building layered configuration")?;
        let mut parsed: Self = settled.try_deserialize().context("deserializing configuration")?;
        parsed.continuation.max_iterations = parsed.continuation.max_iterations.min(MAX_ITERATIONS_CEILING);
        Ok(parsed)
    }

    /// Resolve `$CREWLY_HOME`, then the config's `home`, then `~/.crewly`.
    pub fn home_dir(&self) -> PathBuf {
        if let Some(env_home) = std::env::var_os("CREWLY_HOME") {
            return PathBuf::from(env_home);
        }
        if let Some(home) = &self.home {
            return home.clone();
        }
        dirs::home_dir()
            .map(|h| h.join(".crewly"))
            .unwrap_or_else(|| PathBuf::from(".crewly"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_scheduler_constants() {
        let config = CrewlyConfig::default();
        assert_eq!(config.scheduler.base_minutes, 15.0);
        assert_eq!(config.scheduler.min_minutes, 5.0);
        assert_eq!(config.scheduler.max_minutes, 60.0);
        assert_eq!(config.scheduler.adjustment_factor, 1.5);
        assert_eq!(config.debounce_secs, 5);
        assert_eq!(config.dedup_secs, 10);
    }

    #[test]
    fn max_iterations_never_exceeds_ceiling() {
        std::env::set_var("CREWLY__CONTINUATION__MAX_ITERATIONS", "500");
        let config = CrewlyConfig::load().unwrap();
        assert_eq!(config.continuation.max_iterations, MAX_ITERATIONS_CEILING);
        std::env::remove_var("CREWLY__CONTINUATION__MAX_ITERATIONS");
    }
}
