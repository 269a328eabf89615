//! Collector and arena configuration.
//!
//! All knobs are read once per process from the environment (see
//! [`GcConfig::global`]) but can also be constructed directly, which is
//! what tests do.

use std::sync::OnceLock;
use thiserror::Error;

/// Configuration for arenas and the collector.
///
/// # Example
///
/// ```ignore
/// use rime_gc::GcConfig;
///
/// // Let the collector decide when explicit collections are worth it.
/// let config = GcConfig {
///     manual_collect: false,
///     gc_ratio: 4.0,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    // =========================================================================
    // Collection Triggers
    // =========================================================================
    /// Whether manual collections always run.
    ///
    /// When false, manual collections behave like automatic ones and only
    /// run once usage passes the adaptive threshold.
    ///
    /// Default: true (`RIME_GC_MANUAL`)
    pub manual_collect: bool,

    /// Ratio between the next automatic threshold and the work done by the
    /// previous collection.
    ///
    /// Default: 3.0 (`RIME_GC_RATIO`)
    pub gc_ratio: f64,

    /// Work-to-reclaimed ratio above which a collection is reported as
    /// unproductive at verbosity 1.
    ///
    /// Default: `gc_ratio` squared (`RIME_GC_SQUAWK`)
    pub squawk_ratio: f64,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Collection logging level.
    ///
    /// 0 = none, 1 = unproductive collections, 2 = every collection with
    /// roots, 3 = sweeps too.
    ///
    /// Default: 0 (`RIME_GC_VERBOSE`)
    pub verbosity: u8,

    /// Log peak memory statistics when a root arena is dropped.
    ///
    /// Default: false (`RIME_MEMSTATS`)
    pub memstats: bool,

    /// Count interned objects per type.
    ///
    /// Default: false (`RIME_INTERN_STATS`)
    pub intern_stats: bool,

    /// Check arena invariants after collect, freeze and steal.
    ///
    /// Default: true in debug builds
    pub verify_invariants: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            manual_collect: true,
            gc_ratio: 3.0,
            squawk_ratio: 9.0,
            verbosity: 0,
            memstats: false,
            intern_stats: false,
            verify_invariants: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Manual collections always run (the default).
    pub fn manual() -> Self {
        Self::default()
    }

    /// Manual collections are treated as automatic ones.
    pub fn automatic() -> Self {
        Self {
            manual_collect: false,
            ..Default::default()
        }
    }

    /// Log every collection and keep memory statistics.
    pub fn verbose() -> Self {
        Self {
            verbosity: 3,
            memstats: true,
            intern_stats: true,
            ..Default::default()
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("RIME_GC_MANUAL") {
            config.manual_collect = parse_int::<u64>("RIME_GC_MANUAL", &v)? != 0;
        }
        if let Some(v) = lookup("RIME_GC_RATIO") {
            config.gc_ratio = parse_float("RIME_GC_RATIO", &v)?;
        }
        config.squawk_ratio = match lookup("RIME_GC_SQUAWK") {
            Some(v) => parse_float("RIME_GC_SQUAWK", &v)?,
            None => config.gc_ratio * config.gc_ratio,
        };
        if let Some(v) = lookup("RIME_GC_VERBOSE") {
            config.verbosity = parse_int("RIME_GC_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("RIME_MEMSTATS") {
            config.memstats = parse_int::<u64>("RIME_MEMSTATS", &v)? != 0;
        }
        if let Some(v) = lookup("RIME_INTERN_STATS") {
            config.intern_stats = parse_int::<u64>("RIME_INTERN_STATS", &v)? != 0;
        }

        config.validate()?;
        Ok(config)
    }

    /// The process-wide configuration, read from the environment once.
    ///
    /// A malformed environment is logged and replaced by the defaults.
    pub fn global() -> &'static GcConfig {
        static GLOBAL: OnceLock<GcConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                tracing::warn!(target: "rime_gc::config", %err, "ignoring malformed environment");
                Self::default()
            })
        })
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gc_ratio.is_finite() && self.gc_ratio > 0.0) {
            return Err(ConfigError::InvalidRatio(self.gc_ratio));
        }
        if !(self.squawk_ratio.is_finite() && self.squawk_ratio > 0.0) {
            return Err(ConfigError::InvalidSquawk(self.squawk_ratio));
        }
        if self.verbosity > 3 {
            return Err(ConfigError::InvalidVerbosity(self.verbosity));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("{name}: cannot parse {value:?}")]
    Malformed {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// The collection ratio must be a positive finite number.
    #[error("gc ratio must be positive and finite, got {0}")]
    InvalidRatio(f64),
    /// The squawk ratio must be a positive finite number.
    #[error("squawk ratio must be positive and finite, got {0}")]
    InvalidSquawk(f64),
    /// Verbosity ranges from 0 to 3.
    #[error("verbosity must be between 0 and 3, got {0}")]
    InvalidVerbosity(u8),
}

fn parse_int<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Malformed {
        name,
        value: value.to_owned(),
    })
}

fn parse_float(name: &'static str, value: &str) -> Result<f64, ConfigError> {
    parse_int::<f64>(name, value)
}
