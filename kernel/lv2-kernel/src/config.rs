//! Kernel configuration.
//!
//! Runtime knobs are loaded from a TOML document into [`KernelConfig`];
//! every field has a default so an empty document is valid. Fixed limits
//! that are not worth tuning live here as constants.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// Longest wait the timed-wait engine will perform, in microseconds.
pub const MAX_TIMEOUT_USEC: u64 = u64::MAX / 1000;

/// Host scheduler quantum in microseconds. Waits longer than this are
/// handed to the OS; shorter ones may spin.
#[cfg(windows)]
pub const HOST_QUANTUM_USEC: u64 = 500;
/// Host scheduler quantum in microseconds. Waits longer than this are
/// handed to the OS; shorter ones may spin.
#[cfg(not(windows))]
pub const HOST_QUANTUM_USEC: u64 = 50;

/// Number of concurrently executing general-purpose contexts supported.
pub const MAX_PPU_THREADS: usize = 8;

/// Which sleeping paths get sub-quantum accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepAccuracy {
    /// Never spin; every wait is handed to the OS.
    AsHost,
    /// Spin for the tail of `usleep`-style sleeps only.
    #[default]
    Usleep,
    /// Spin for the tail of every bounded wait.
    AllTimers,
}

/// What kind of wait is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyClass {
    /// A guest sleep syscall.
    Usleep,
    /// Any other bounded wait (receive timeouts, the timer poller).
    Timer,
}

impl SleepAccuracy {
    /// Returns `true` if waits of `class` should spin through their tail.
    pub const fn is_accurate(self, class: AccuracyClass) -> bool {
        match self {
            Self::AsHost => false,
            Self::Usleep => matches!(class, AccuracyClass::Usleep),
            Self::AllTimers => true,
        }
    }
}

/// Cooperative preemption cadence.
///
/// When enabled, every `interval_cycles` of the cycle counter one running
/// context is asked to yield so that work outside the guest threads (the
/// render consumer) gets a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreemptConfig {
    /// Whether `schedule_all` samples the cycle counter at all.
    pub enabled: bool,
    /// Cycles between two preemption requests.
    pub interval_cycles: u64,
}

impl PreemptConfig {
    /// Default cadence: 2 ms of a nanosecond cycle counter.
    pub const DEFAULT_INTERVAL_CYCLES: u64 = 2_000_000;
}

impl Default for PreemptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_cycles: Self::DEFAULT_INTERVAL_CYCLES,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Size of the execution window: how many ready contexts may run at once.
    pub ppu_threads: usize,
    /// Guest clock speed in percent of host speed.
    pub clocks_scale: u32,
    /// Accuracy policy for short waits.
    pub sleep_timers_accuracy: SleepAccuracy,
    /// Cooperative preemption.
    pub preempt: PreemptConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ppu_threads: 2,
            clocks_scale: 100,
            sleep_timers_accuracy: SleepAccuracy::default(),
            preempt: PreemptConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&text)
    }

    /// Checks every field against its supported range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PPU_THREADS).contains(&self.ppu_threads) {
            return Err(ConfigError::OutOfRange {
                field: "ppu_threads",
                value: self.ppu_threads as u64,
            });
        }
        if !(10..=1000).contains(&self.clocks_scale) {
            return Err(ConfigError::OutOfRange {
                field: "clocks_scale",
                value: u64::from(self.clocks_scale),
            });
        }
        if self.preempt.enabled && self.preempt.interval_cycles == 0 {
            return Err(ConfigError::OutOfRange {
                field: "preempt.interval_cycles",
                value: 0,
            });
        }
        Ok(())
    }
}

/// Errors produced while loading a [`KernelConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(std::io::Error),
    /// The document is not valid TOML or has unknown keys.
    Parse(toml::de::Error),
    /// A value is outside its supported range.
    OutOfRange {
        /// Dotted key of the offending field.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read config: {e}"),
            Self::Parse(e) => write!(f, "invalid config: {e}"),
            Self::OutOfRange { field, value } => {
                write!(f, "config value {field} = {value} is out of range")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::OutOfRange { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.ppu_threads, 2);
        assert_eq!(config.sleep_timers_accuracy, SleepAccuracy::Usleep);
        assert!(!config.preempt.enabled);
    }

    #[test]
    fn full_document_parses() {
        let config = KernelConfig::from_toml_str(
            r#"
            ppu_threads = 3
            clocks_scale = 150
            sleep_timers_accuracy = "all_timers"

            [preempt]
            enabled = true
            interval_cycles = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.ppu_threads, 3);
        assert_eq!(config.clocks_scale, 150);
        assert_eq!(config.sleep_timers_accuracy, SleepAccuracy::AllTimers);
        assert_eq!(
            config.preempt,
            PreemptConfig {
                enabled: true,
                interval_cycles: 500
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = KernelConfig::from_toml_str("ppu_thread = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = KernelConfig::from_toml_str("ppu_threads = 0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "config value ppu_threads = 0 is out of range"
        );
        let err = KernelConfig::from_toml_str("clocks_scale = 5").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "clocks_scale",
                ..
            }
        ));
    }

    #[test]
    fn accuracy_policy_matrix() {
        assert!(!SleepAccuracy::AsHost.is_accurate(AccuracyClass::Usleep));
        assert!(SleepAccuracy::Usleep.is_accurate(AccuracyClass::Usleep));
        assert!(!SleepAccuracy::Usleep.is_accurate(AccuracyClass::Timer));
        assert!(SleepAccuracy::AllTimers.is_accurate(AccuracyClass::Timer));
    }
}
