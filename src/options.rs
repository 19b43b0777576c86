use crate::exe::MAX_POOL_SIZE;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an optional JSON options file.
pub const CONFIG_ENV: &str = "CONTAFLIX_CONFIG";

/// Longest duration accepted by any time option: a bit over a year.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// Server options. Every field is optional and falls back to a default through its accessor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContaflixOptions {
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Send SIGUSR1 to the parent process once connections are accepted.
    pub signal_parent_ready: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub batch_priority: Option<i32>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_secs: Option<u64>,
    pub lease_timeout_secs: Option<u64>,
    pub idle_poll_ms: Option<u64>,
    pub busy_poll_ms: Option<u64>,
    pub queue_processor_enabled: Option<bool>,
    pub processor_interval_ms: Option<u64>,
    pub processor_concurrency: Option<usize>,
    pub worker_offline_secs: Option<u64>,
    pub janitor_interval_secs: Option<u64>,
    pub audit_capacity: Option<usize>,
    pub notification_capacity: Option<usize>,

    /// JSON file with the clients and payments loaded at startup.
    pub seed_file: Option<PathBuf>,

    /// Fixed seed for simulated closing values.
    pub simulation_seed: Option<u64>,
}

impl ContaflixOptions {
    /// Options from the file named by `CONTAFLIX_CONFIG`, if set, overridden by `CONTAFLIX_*`
    /// environment variables.
    pub fn load() -> Result<Self, anyhow::Error> {
        let mut options = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        options.apply_env(|name| std::env::var(name).ok())?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading options file {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing options file {}", path.display()))
    }

    /// Override options with the variables `lookup` knows about.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = &lookup;
        override_with(&mut self.host, lookup, "CONTAFLIX_HOST")?;
        override_with(&mut self.port, lookup, "CONTAFLIX_PORT")?;
        override_with(&mut self.signal_parent_ready, lookup, "CONTAFLIX_SIGNAL_PARENT_READY")?;
        override_with(&mut self.max_concurrency, lookup, "CONTAFLIX_MAX_CONCURRENCY")?;
        override_with(&mut self.batch_priority, lookup, "CONTAFLIX_BATCH_PRIORITY")?;
        override_with(&mut self.max_retries, lookup, "CONTAFLIX_MAX_RETRIES")?;
        override_with(&mut self.retry_base_delay_secs, lookup, "CONTAFLIX_RETRY_BASE_DELAY_SECS")?;
        override_with(&mut self.lease_timeout_secs, lookup, "CONTAFLIX_LEASE_TIMEOUT_SECS")?;
        override_with(&mut self.idle_poll_ms, lookup, "CONTAFLIX_IDLE_POLL_MS")?;
        override_with(&mut self.busy_poll_ms, lookup, "CONTAFLIX_BUSY_POLL_MS")?;
        override_with(&mut self.queue_processor_enabled, lookup, "CONTAFLIX_QUEUE_PROCESSOR_ENABLED")?;
        override_with(&mut self.processor_interval_ms, lookup, "CONTAFLIX_PROCESSOR_INTERVAL_MS")?;
        override_with(&mut self.processor_concurrency, lookup, "CONTAFLIX_PROCESSOR_CONCURRENCY")?;
        override_with(&mut self.worker_offline_secs, lookup, "CONTAFLIX_WORKER_OFFLINE_SECS")?;
        override_with(&mut self.janitor_interval_secs, lookup, "CONTAFLIX_JANITOR_INTERVAL_SECS")?;
        override_with(&mut self.audit_capacity, lookup, "CONTAFLIX_AUDIT_CAPACITY")?;
        override_with(&mut self.notification_capacity, lookup, "CONTAFLIX_NOTIFICATION_CAPACITY")?;
        override_with(&mut self.seed_file, lookup, "CONTAFLIX_SEED_FILE")?;
        override_with(&mut self.simulation_seed, lookup, "CONTAFLIX_SIMULATION_SEED")?;
        Ok(())
    }

    /// Reject durations and worker counts the server can't schedule.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let seconds = [
            ("retry_base_delay_secs", self.retry_base_delay_secs),
            ("lease_timeout_secs", self.lease_timeout_secs),
            ("worker_offline_secs", self.worker_offline_secs),
            ("janitor_interval_secs", self.janitor_interval_secs),
        ];
        for (name, value) in seconds {
            if let Some(secs) = value.filter(|secs| *secs > MAX_DURATION_SECS) {
                bail!("{name} {secs} exceeds {MAX_DURATION_SECS} seconds");
            }
        }

        let millis = [
            ("idle_poll_ms", self.idle_poll_ms),
            ("busy_poll_ms", self.busy_poll_ms),
            ("processor_interval_ms", self.processor_interval_ms),
        ];
        for (name, value) in millis {
            if let Some(ms) = value.filter(|ms| *ms > MAX_DURATION_SECS * 1000) {
                bail!("{name} {ms} exceeds {} milliseconds", MAX_DURATION_SECS * 1000);
            }
        }

        for (name, value) in [("max_concurrency", self.max_concurrency), ("processor_concurrency", self.processor_concurrency)] {
            if let Some(n) = value.filter(|n| *n > MAX_POOL_SIZE) {
                bail!("{name} {n} exceeds {MAX_POOL_SIZE}");
            }
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3001)
    }

    pub fn signal_parent_ready(&self) -> bool {
        self.signal_parent_ready.unwrap_or(false)
    }

    /// Concurrent workers of a batch when the request doesn't say.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(5).clamp(1, MAX_POOL_SIZE)
    }

    pub fn batch_priority(&self) -> i32 {
        self.batch_priority.unwrap_or(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(crate::messaging::DEFAULT_MAX_RETRIES)
    }

    pub fn retry_base_delay(&self) -> chrono::Duration {
        seconds(self.retry_base_delay_secs, 300)
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        seconds(self.lease_timeout_secs, 600)
    }

    pub fn idle_poll(&self) -> Duration {
        millis(self.idle_poll_ms, 1000)
    }

    pub fn busy_poll(&self) -> Duration {
        millis(self.busy_poll_ms, 500)
    }

    pub fn queue_processor_enabled(&self) -> bool {
        self.queue_processor_enabled.unwrap_or(true)
    }

    pub fn processor_interval(&self) -> Duration {
        millis(self.processor_interval_ms, 1000).max(Duration::from_millis(1))
    }

    pub fn processor_concurrency(&self) -> usize {
        self.processor_concurrency.unwrap_or(4).clamp(1, MAX_POOL_SIZE)
    }

    /// Workers without a heartbeat for this long are considered offline.
    pub fn worker_offline_after(&self) -> chrono::Duration {
        seconds(self.worker_offline_secs, 300)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.unwrap_or(60).clamp(1, MAX_DURATION_SECS))
    }

    pub fn audit_capacity(&self) -> usize {
        self.audit_capacity.unwrap_or(1000)
    }

    pub fn notification_capacity(&self) -> usize {
        self.notification_capacity.unwrap_or(200)
    }
}

/// `value` seconds, or `default`, capped at [`MAX_DURATION_SECS`].
fn seconds(value: Option<u64>, default: u64) -> chrono::Duration {
    let secs = value.unwrap_or(default).min(MAX_DURATION_SECS);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default).min(MAX_DURATION_SECS * 1000))
}

fn override_with<T, F>(field: &mut Option<T>, lookup: &F, name: &str) -> Result<(), anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        let value = raw.trim().parse().with_context(|| format!("invalid value {raw:?} for {name}"))?;
        *field = Some(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_to_missing_options() {
        let options = ContaflixOptions::default();
        assert_eq!(options.host(), "127.0.0.1");
        assert_eq!(options.port(), 3001);
        assert_eq!(options.max_concurrency(), 5);
        assert_eq!(options.max_retries(), 3);
        assert_eq!(options.retry_base_delay(), chrono::Duration::minutes(5));
        assert_eq!(options.busy_poll(), Duration::from_millis(500));
        assert_eq!(options.idle_poll(), Duration::from_secs(1));
    }

    #[test]
    fn environment_overrides_file_values() -> Result<(), anyhow::Error> {
        let mut options: ContaflixOptions = serde_json::from_str(r#"{ "port": 4000, "max_concurrency": 2 }"#)?;
        let env = HashMap::from([("CONTAFLIX_PORT", "5000"), ("CONTAFLIX_SEED_FILE", "seed.json")]);

        options.apply_env(|name| env.get(name).map(|v| v.to_string()))?;
        assert_eq!(options.port(), 5000);
        assert_eq!(options.max_concurrency(), 2);
        assert_eq!(options.seed_file, Some(PathBuf::from("seed.json")));
        Ok(())
    }

    #[test]
    fn invalid_variable_is_named_in_the_error() {
        let mut options = ContaflixOptions::default();
        let err = options
            .apply_env(|name| (name == "CONTAFLIX_PORT").then(|| "not-a-port".to_owned()))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value \"not-a-port\" for CONTAFLIX_PORT");
    }

    #[test]
    fn oversized_values_are_rejected_or_capped() {
        let options = ContaflixOptions {
            lease_timeout_secs: Some(u64::MAX),
            max_concurrency: Some(usize::MAX),
            ..ContaflixOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert_eq!(err.to_string(), format!("lease_timeout_secs {} exceeds {MAX_DURATION_SECS} seconds", u64::MAX));

        // Accessors never wrap or panic, even on options that weren't validated.
        assert_eq!(options.lease_timeout(), chrono::Duration::seconds(MAX_DURATION_SECS as i64));
        assert_eq!(options.max_concurrency(), MAX_POOL_SIZE);

        let options = ContaflixOptions { processor_concurrency: Some(MAX_POOL_SIZE + 1), ..ContaflixOptions::default() };
        assert_eq!(options.validate().unwrap_err().to_string(), "processor_concurrency 1025 exceeds 1024");
        assert!(ContaflixOptions::default().validate().is_ok());
    }
}
