use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When the session pushes pending changes to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlushMode {
    /// Flush before queries that may see pending changes and at commit
    Auto,
    /// Flush only at commit
    Commit,
    /// Flush only on explicit `Session::flush`
    Manual,
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Self::Auto),
            "COMMIT" => Ok(Self::Commit),
            "MANUAL" | "NEVER" => Ok(Self::Manual),
            other => Err(format!("Unknown flush mode '{}'", other)),
        }
    }
}

/// What to do when a database sequence's increment differs from the mapped one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SequenceMismatchStrategy {
    Exception,
    Log,
    Fix,
    None,
}

impl FromStr for SequenceMismatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXCEPTION" => Ok(Self::Exception),
            "LOG" => Ok(Self::Log),
            "FIX" => Ok(Self::Fix),
            "NONE" => Ok(Self::None),
            other => Err(format!("Unknown sequence mismatch strategy '{}'", other)),
        }
    }
}

/// Session factory settings
///
/// Built in code with the chained setters or read from `ormkit.*` properties.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum association depth fetched with JOIN (None = unlimited)
    pub max_fetch_depth: Option<usize>,

    /// Batch size used when a mapping declares none
    pub default_batch_fetch_size: usize,

    /// Statement timeout passed to the JDBC layer
    pub query_timeout: Option<Duration>,

    pub use_second_level_cache: bool,

    /// Wrap generated statements into stored routines
    pub use_stored_procedures: bool,

    pub prefer_pooled_values_lo: bool,

    pub sequence_mismatch_strategy: SequenceMismatchStrategy,

    /// Use the thread-tracking JTA synchronization coordinator
    pub jta_track_by_thread: bool,

    pub flush_mode: FlushMode,

    /// Number of prepared load plans kept per factory
    pub plan_cache_size: usize,

    /// Entries per second-level cache region
    pub cache_region_size: usize,

    /// Soft-lock timeout for read-write cache regions
    pub cache_lock_timeout: Duration,
}

impl Settings {
    pub fn new() -> Self {
        Self {
            max_fetch_depth: None,
            default_batch_fetch_size: 1,
            query_timeout: None,
            use_second_level_cache: true,
            use_stored_procedures: false,
            prefer_pooled_values_lo: false,
            sequence_mismatch_strategy: SequenceMismatchStrategy::Exception,
            jta_track_by_thread: true,
            flush_mode: FlushMode::Auto,
            plan_cache_size: 128,
            cache_region_size: 1024,
            cache_lock_timeout: Duration::from_secs(60),
        }
    }

    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = Some(depth);
        self
    }

    pub fn default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn use_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    pub fn use_stored_procedures(mut self, enabled: bool) -> Self {
        self.use_stored_procedures = enabled;
        self
    }

    pub fn prefer_pooled_values_lo(mut self, enabled: bool) -> Self {
        self.prefer_pooled_values_lo = enabled;
        self
    }

    pub fn sequence_mismatch_strategy(mut self, strategy: SequenceMismatchStrategy) -> Self {
        self.sequence_mismatch_strategy = strategy;
        self
    }

    pub fn jta_track_by_thread(mut self, enabled: bool) -> Self {
        self.jta_track_by_thread = enabled;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn plan_cache_size(mut self, size: usize) -> Self {
        self.plan_cache_size = size;
        self
    }

    pub fn cache_region_size(mut self, size: usize) -> Self {
        self.cache_region_size = size;
        self
    }

    pub fn cache_lock_timeout(mut self, timeout: Duration) -> Self {
        self.cache_lock_timeout = timeout;
        self
    }

    /// Parse `ormkit.*` properties on top of the defaults
    ///
    /// Unknown keys under the prefix are rejected; other keys are ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, String> {
        let mut settings = Self::new();

        for (key, raw) in properties {
            let Some(name) = key.strip_prefix("ormkit.") else {
                continue;
            };
            let value = raw.trim();
            match name {
                "max_fetch_depth" => {
                    settings.max_fetch_depth = if value.is_empty() || value == "-1" {
                        None
                    } else {
                        Some(parse_number(key, value)?)
                    };
                }
                "default_batch_fetch_size" => {
                    settings.default_batch_fetch_size = parse_number(key, value)?;
                }
                "query_timeout_ms" => {
                    settings.query_timeout =
                        Some(Duration::from_millis(parse_number(key, value)? as u64));
                }
                "use_second_level_cache" => {
                    settings.use_second_level_cache = parse_flag(key, value)?;
                }
                "use_stored_procedures" => {
                    settings.use_stored_procedures = parse_flag(key, value)?;
                }
                "prefer_pooled_values_lo" => {
                    settings.prefer_pooled_values_lo = parse_flag(key, value)?;
                }
                "sequence_increment_size_mismatch_strategy" => {
                    settings.sequence_mismatch_strategy = value.parse()?;
                }
                "jta_track_by_thread" => {
                    settings.jta_track_by_thread = parse_flag(key, value)?;
                }
                "flush_mode" => {
                    settings.flush_mode = value.parse()?;
                }
                "plan_cache_size" => {
                    settings.plan_cache_size = parse_number(key, value)?;
                }
                "cache_region_size" => {
                    settings.cache_region_size = parse_number(key, value)?;
                }
                "cache_lock_timeout_ms" => {
                    settings.cache_lock_timeout =
                        Duration::from_millis(parse_number(key, value)? as u64);
                }
                _ => return Err(format!("Unknown setting '{}'", key)),
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_batch_fetch_size == 0 {
            return Err("default_batch_fetch_size must be > 0".to_string());
        }

        if self.plan_cache_size == 0 {
            return Err("plan_cache_size must be > 0".to_string());
        }

        if self.cache_region_size == 0 {
            return Err("cache_region_size must be > 0".to_string());
        }

        if self.cache_lock_timeout.is_zero() {
            return Err("cache_lock_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse()
        .map_err(|_| format!("Setting '{}' expects a number, got '{}'", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("Setting '{}' expects a boolean, got '{}'", key, value)),
    }
}
