//! Configuration
//!
//! ## Provider settings
//! The `config` JSON passed in `ProviderArgs`:
//! ```json
//! { "buffer_capacity": 160000, "max_fetch_count": 160000,
//!   "reduction_interval_ms": 1000, "cohort_size": 4, "batched_reduction": false }
//! ```
//! Every field is optional.
//!
//! ## Service configuration
//! Loaded from a TOML file (`TAGMON_CONFIG_FILE`), then overridden by
//! environment variables:
//! - `TAGMON_LISTEN_ADDR`: address the RPC server binds
//! - `TAGMON_PROVIDER_ID`: id the provider registers under
//! - `TAGMON_TOKEN`: shared secret required on every request
//! - `TAGMON_AGGREGATOR_ADDRESS_FILE`: aggregator address file
//! - `TAGMON_REDUCER_ADDRESS_FILE`: reducer address file
//! - `TAGMON_PROVIDER_CONFIG`: provider settings JSON
//!
//! ## Address files
//! Aggregators: a `count` line, then `count` lines of `address provider_id db_name`.
//! Reducer: one `address provider_id` line.

use crate::error::{MonError, Result};
use crate::metrics::DEFAULT_BUFFER_CAPACITY;
use crate::protocol::ProviderId;
use crate::reduction::{ReductionEngine, RespKvSink, RespReducer, SharedReducer, SharedSink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-provider tuning, parsed from the provider's JSON config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    /// Samples each metric can hold
    pub buffer_capacity: usize,
    /// Upper bound on samples returned by one fetch
    pub max_fetch_count: usize,
    /// Run a reduction cycle this often; `None` disables periodic reduction
    pub reduction_interval_ms: Option<u64>,
    /// Providers expected to contribute to each global reduction
    pub cohort_size: u32,
    /// Use `reduce_all_batched` for periodic cycles
    pub batched_reduction: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_fetch_count: DEFAULT_BUFFER_CAPACITY,
            reduction_interval_ms: None,
            cohort_size: 1,
            batched_reduction: false,
        }
    }
}

impl ProviderSettings {
    /// Parse provider JSON; absent config means defaults
    pub fn from_json(config: Option<&str>) -> Result<Self> {
        let settings = match config {
            None => ProviderSettings::default(),
            Some(text) if text.trim().is_empty() => ProviderSettings::default(),
            Some(text) => serde_json::from_str(text)
                .map_err(|e| MonError::config(format!("provider config: {}", e)))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(MonError::config("buffer_capacity must be > 0"));
        }
        if self.max_fetch_count == 0 {
            return Err(MonError::config("max_fetch_count must be > 0"));
        }
        if self.cohort_size == 0 {
            return Err(MonError::config("cohort_size must be > 0"));
        }
        if self.reduction_interval_ms == Some(0) {
            return Err(MonError::config("reduction_interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn reduction_interval(&self) -> Option<Duration> {
        self.reduction_interval_ms.map(Duration::from_millis)
    }
}

/// One line of the aggregator address file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorAddress {
    pub address: String,
    pub provider_id: ProviderId,
    pub db_name: String,
}

/// The reducer address file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerAddress {
    pub address: String,
    pub provider_id: ProviderId,
}

fn parse_provider_id(field: &str, line: usize) -> Result<ProviderId> {
    field
        .parse::<ProviderId>()
        .map_err(|_| MonError::config(format!("line {}: bad provider id '{}'", line, field)))
}

pub fn parse_aggregator_addresses(text: &str) -> Result<Vec<AggregatorAddress>> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| MonError::config("aggregator file is empty"))?;
    let count: usize = header
        .parse()
        .map_err(|_| MonError::config(format!("bad aggregator count '{}'", header)))?;

    let mut addresses = Vec::with_capacity(count);
    for (idx, line) in lines.take(count).enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(MonError::config(format!(
                "line {}: expected 'address provider_id db_name'",
                idx + 2
            )));
        }
        addresses.push(AggregatorAddress {
            address: fields[0].to_string(),
            provider_id: parse_provider_id(fields[1], idx + 2)?,
            db_name: fields[2].to_string(),
        });
    }
    if addresses.len() != count {
        return Err(MonError::config(format!(
            "aggregator file announces {} entries but lists {}",
            count,
            addresses.len()
        )));
    }
    Ok(addresses)
}

pub fn parse_reducer_address(text: &str) -> Result<ReducerAddress> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| MonError::config("reducer file is empty"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(MonError::config("expected 'address provider_id'"));
    }
    Ok(ReducerAddress {
        address: fields[0].to_string(),
        provider_id: parse_provider_id(fields[1], 1)?,
    })
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| MonError::config(format!("{}: {}", path.display(), e)))
}

pub fn load_aggregator_addresses(path: &Path) -> Result<Vec<AggregatorAddress>> {
    parse_aggregator_addresses(&read_file(path)?)
}

pub fn load_reducer_address(path: &Path) -> Result<ReducerAddress> {
    parse_reducer_address(&read_file(path)?)
}

/// Configuration of the `tagmon-provider` service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub provider_id: ProviderId,
    pub token: Option<String>,
    pub aggregator_address_file: Option<PathBuf>,
    pub reducer_address_file: Option<PathBuf>,
    /// Provider settings JSON
    pub provider_config: Option<String>,
    /// Finalize the provider when the server shuts down
    pub push_finalize_callback: bool,
    /// Register a self-monitoring uptime counter
    pub demo_metric: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen_addr: "0.0.0.0:7379".to_string(),
            provider_id: 1,
            token: None,
            aggregator_address_file: None,
            reducer_address_file: None,
            provider_config: None,
            push_finalize_callback: true,
            demo_metric: true,
        }
    }
}

impl ServiceConfig {
    /// Load from `TAGMON_CONFIG_FILE` (if set) and the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("TAGMON_CONFIG_FILE") {
            Some(path) => Self::from_toml_file(Path::new(&path))?,
            None => ServiceConfig::default(),
        };
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        Self::from_toml_str(&read_file(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MonError::config(format!("service config: {}", e)))
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("TAGMON_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(id) = lookup("TAGMON_PROVIDER_ID") {
            self.provider_id = id
                .parse()
                .map_err(|_| MonError::config(format!("TAGMON_PROVIDER_ID '{}' is not a u16", id)))?;
        }
        if let Some(token) = lookup("TAGMON_TOKEN") {
            self.token = Some(token);
        }
        if let Some(path) = lookup("TAGMON_AGGREGATOR_ADDRESS_FILE") {
            self.aggregator_address_file = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TAGMON_REDUCER_ADDRESS_FILE") {
            self.reducer_address_file = Some(PathBuf::from(path));
        }
        if let Some(json) = lookup("TAGMON_PROVIDER_CONFIG") {
            self.provider_config = Some(json);
        }
        Ok(())
    }

    pub fn provider_settings(&self) -> Result<ProviderSettings> {
        ProviderSettings::from_json(self.provider_config.as_deref())
    }

    /// Build RESP-backed aggregation collaborators for whichever address
    /// files are configured
    pub fn reduction_engine(&self) -> Result<ReductionEngine> {
        let sinks: Vec<SharedSink> = match &self.aggregator_address_file {
            Some(path) => load_aggregator_addresses(path)?
                .into_iter()
                .map(|a| Arc::new(RespKvSink::new(a.address, a.db_name)) as SharedSink)
                .collect(),
            None => Vec::new(),
        };
        let reducer: Option<SharedReducer> = match &self.reducer_address_file {
            Some(path) => {
                let r = load_reducer_address(path)?;
                Some(Arc::new(RespReducer::new(r.address, r.provider_id)) as SharedReducer)
            }
            None => None,
        };
        Ok(ReductionEngine::new(sinks, reducer))
    }
}
