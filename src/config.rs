//! Runtime configuration, loaded from `ROLLCALL_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `ROLLCALL_BATCH_THRESHOLD` | `50` |
//! | `ROLLCALL_FLUSH_INTERVAL_SECS` | `10` |
//! | `ROLLCALL_FAILURE_POLICY` | `requeue` (or `drop`) |
//! | `ROLLCALL_UTC_OFFSET_MINUTES` | `0` |
//! | `ROLLCALL_STORE_PATH` | `rollcall-cache.db` |
//! | `ROLLCALL_LEDGER_PATH` | `rollcall-ledger.db` |
//! | `ROLLCALL_ROSTER_PATH` | `roster.json` |
//!
//! Unset variables fall back to the default (logged at `info`). A set but
//! unparseable variable is an error rather than a silent fallback.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::flusher::{
    FailurePolicy, FlusherConfig, DEFAULT_BATCH_THRESHOLD, DEFAULT_FLUSH_INTERVAL_SECS,
};
use crate::types::VenueClock;

pub const DEFAULT_STORE_PATH: &str = "rollcall-cache.db";
pub const DEFAULT_LEDGER_PATH: &str = "rollcall-ledger.db";
pub const DEFAULT_ROSTER_PATH: &str = "roster.json";

#[derive(Debug, Clone)]
pub struct Config {
    /// Pending queue length that triggers an early flush.
    pub batch_threshold: usize,

    /// Period of the background flush tick.
    pub flush_interval: Duration,

    /// What happens to a batch the ledger refused.
    pub failure_policy: FailurePolicy,

    /// Venue offset from UTC, in minutes.
    pub utc_offset_minutes: i32,

    pub store_path: PathBuf,
    pub ledger_path: PathBuf,
    pub roster_path: PathBuf,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            batch_threshold: try_load(
                &lookup,
                "ROLLCALL_BATCH_THRESHOLD",
                DEFAULT_BATCH_THRESHOLD,
            )?,
            flush_interval: Duration::from_secs(try_load(
                &lookup,
                "ROLLCALL_FLUSH_INTERVAL_SECS",
                DEFAULT_FLUSH_INTERVAL_SECS,
            )?),
            failure_policy: try_load(&lookup, "ROLLCALL_FAILURE_POLICY", FailurePolicy::default())?,
            utc_offset_minutes: try_load(&lookup, "ROLLCALL_UTC_OFFSET_MINUTES", 0)?,
            store_path: try_load(&lookup, "ROLLCALL_STORE_PATH", PathBuf::from(DEFAULT_STORE_PATH))?,
            ledger_path: try_load(
                &lookup,
                "ROLLCALL_LEDGER_PATH",
                PathBuf::from(DEFAULT_LEDGER_PATH),
            )?,
            roster_path: try_load(
                &lookup,
                "ROLLCALL_ROSTER_PATH",
                PathBuf::from(DEFAULT_ROSTER_PATH),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_threshold == 0 {
            return Err(Error::Config("batch threshold must be at least 1".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush interval must be at least 1 second".into()));
        }
        self.clock()?;
        Ok(())
    }

    /// Settings for the background flusher.
    pub fn flusher_config(&self) -> FlusherConfig {
        FlusherConfig {
            batch_threshold: self.batch_threshold,
            flush_interval: self.flush_interval,
            failure_policy: self.failure_policy,
        }
    }

    /// The venue clock for this offset.
    pub fn clock(&self) -> Result<VenueClock> {
        VenueClock::from_offset_minutes(self.utc_offset_minutes)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            failure_policy: FailurePolicy::default(),
            utc_offset_minutes: 0,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            roster_path: PathBuf::from(DEFAULT_ROSTER_PATH),
        }
    }
}

fn try_load<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + std::fmt::Debug,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key} value '{raw}': {e}"))),
        None => {
            info!("{key} not set, using default: {default:?}");
            Ok(default)
        }
    }
}
