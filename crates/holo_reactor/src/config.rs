//! Reactor tuning knobs.
//!
//! Defaults suit the in-process cluster. [`ReactorConfig::from_env`] applies
//! `HOLO_REACTOR_*` environment variables on top of them, and the binary's
//! flags override both.

use std::time::Duration;

use anyhow::Context;

const DEFAULT_BACKOFF_BASE_MS: u64 = 50;
const DEFAULT_BACKOFF_MAX_MS: u64 = 1_000;
const DEFAULT_ECHO_ACK_TIMEOUT_MS: u64 = 500;
const DEFAULT_WRITE_ACK_TIMEOUT_MS: u64 = 500;
const DEFAULT_STALL_REPORT_AFTER_MS: u64 = 250;
const DEFAULT_ERASE_GRACE_MS: u64 = 20;
const DEFAULT_BACKFILL_CHUNK_KEYS: usize = 64;
const DEFAULT_BACKFILL_CHANNEL_DEPTH: usize = 16;
const DEFAULT_ROUTER_TIMEOUT_MS: u64 = 2_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Delay after the first failed attempt of a role driver.
    pub backoff_base: Duration,
    /// Upper bound for the doubling retry delay.
    pub backoff_max: Duration,
    /// How long a primary-elect waits for peers to acknowledge its card.
    pub echo_ack_timeout: Duration,
    /// How long a write waits for an up-to-date secondary before dropping it.
    pub write_ack_timeout: Duration,
    /// Waits longer than this publish their reason on the activity.
    pub stall_report_after: Duration,
    /// Pause between the new owners becoming ready and erasing revoked data.
    pub erase_grace: Duration,
    pub backfill_chunk_keys: usize,
    pub backfill_channel_depth: usize,
    /// Total time the router keeps retrying a request across stale targets.
    pub router_timeout: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            echo_ack_timeout: Duration::from_millis(DEFAULT_ECHO_ACK_TIMEOUT_MS),
            write_ack_timeout: Duration::from_millis(DEFAULT_WRITE_ACK_TIMEOUT_MS),
            stall_report_after: Duration::from_millis(DEFAULT_STALL_REPORT_AFTER_MS),
            erase_grace: Duration::from_millis(DEFAULT_ERASE_GRACE_MS),
            backfill_chunk_keys: DEFAULT_BACKFILL_CHUNK_KEYS,
            backfill_channel_depth: DEFAULT_BACKFILL_CHANNEL_DEPTH,
            router_timeout: Duration::from_millis(DEFAULT_ROUTER_TIMEOUT_MS),
        }
    }
}

impl ReactorConfig {
    /// Defaults overridden by any `HOLO_REACTOR_*` variable that is set.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let millis = |name: &str, slot: &mut Duration| -> anyhow::Result<()> {
            if let Some(raw) = lookup(name) {
                *slot = Duration::from_millis(parse_u64(name, &raw)?);
            }
            Ok(())
        };
        millis("HOLO_REACTOR_BACKOFF_BASE_MS", &mut config.backoff_base)?;
        millis("HOLO_REACTOR_BACKOFF_MAX_MS", &mut config.backoff_max)?;
        millis("HOLO_REACTOR_ECHO_ACK_TIMEOUT_MS", &mut config.echo_ack_timeout)?;
        millis("HOLO_REACTOR_WRITE_ACK_TIMEOUT_MS", &mut config.write_ack_timeout)?;
        millis("HOLO_REACTOR_STALL_REPORT_AFTER_MS", &mut config.stall_report_after)?;
        millis("HOLO_REACTOR_ERASE_GRACE_MS", &mut config.erase_grace)?;
        millis("HOLO_REACTOR_ROUTER_TIMEOUT_MS", &mut config.router_timeout)?;
        if let Some(raw) = lookup("HOLO_REACTOR_BACKFILL_CHUNK_KEYS") {
            config.backfill_chunk_keys = parse_positive_usize("HOLO_REACTOR_BACKFILL_CHUNK_KEYS", &raw)?;
        }
        if let Some(raw) = lookup("HOLO_REACTOR_BACKFILL_CHANNEL_DEPTH") {
            config.backfill_channel_depth =
                parse_positive_usize("HOLO_REACTOR_BACKFILL_CHANNEL_DEPTH", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations no reactor can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_max < self.backoff_base {
            anyhow::bail!(
                "backoff max ({}ms) is below the backoff base ({}ms)",
                self.backoff_max.as_millis(),
                self.backoff_base.as_millis()
            );
        }
        if self.backfill_chunk_keys == 0 || self.backfill_channel_depth == 0 {
            anyhow::bail!("backfill chunk size and channel depth must be positive");
        }
        Ok(())
    }

    /// Retry delay after `failures` consecutive failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = 1u32 << (failures - 1).min(16);
        self.backoff_base
            .saturating_mul(exp)
            .min(self.backoff_max)
    }
}

fn parse_u64(name: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{name} must be an unsigned integer, got {raw:?}"))
}

fn parse_positive_usize(name: &str, raw: &str) -> anyhow::Result<usize> {
    let value = raw
        .trim()
        .parse::<usize>()
        .with_context(|| format!("{name} must be an unsigned integer, got {raw:?}"))?;
    if value == 0 {
        anyhow::bail!("{name} must be positive");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = ReactorConfig::from_lookup(lookup(&[
            ("HOLO_REACTOR_BACKOFF_BASE_MS", "10"),
            ("HOLO_REACTOR_BACKFILL_CHUNK_KEYS", "8"),
        ]))
        .expect("valid overrides");
        assert_eq!(config.backoff_base, Duration::from_millis(10));
        assert_eq!(config.backfill_chunk_keys, 8);
        assert_eq!(config.router_timeout, ReactorConfig::default().router_timeout);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = ReactorConfig::from_lookup(lookup(&[("HOLO_REACTOR_ERASE_GRACE_MS", "soon")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("HOLO_REACTOR_ERASE_GRACE_MS"));

        let err = ReactorConfig::from_lookup(lookup(&[("HOLO_REACTOR_BACKFILL_CHUNK_KEYS", "0")]))
            .expect_err("zero chunk size");
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let err = ReactorConfig::from_lookup(lookup(&[
            ("HOLO_REACTOR_BACKOFF_BASE_MS", "200"),
            ("HOLO_REACTOR_BACKOFF_MAX_MS", "100"),
        ]))
        .expect_err("cap below base");
        assert!(err.to_string().contains("backoff max"));
        assert!(ReactorConfig::default().validate().is_ok());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ReactorConfig::default();
        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
        assert_eq!(config.backoff(30), config.backoff_max);
    }
}
