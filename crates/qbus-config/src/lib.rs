//! Configuration loading for one queue instance (spec §6 "Configuration
//! (recognized options)"): environment-variable based for process
//! deployment, layered-YAML based for file-driven deployment.

use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use qbus_core::backoff::RetryBackoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The recognized options of spec §6, fully resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub table_name: String,
    pub nb_threads: usize,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub claim_batch_size: i64,
    #[serde(with = "duration_secs")]
    pub claim_lease: Duration,
    pub max_failure_retries: i32,
    pub retry_backoff: BackoffConfig,
    pub instance_name: String,
}

/// Serializable mirror of [`RetryBackoff`], since the backoff policy itself
/// is a Rust enum carrying `Duration`s that need a config-file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },
    CappedExponential {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(with = "duration_secs")]
        cap: Duration,
    },
}

impl From<BackoffConfig> for RetryBackoff {
    fn from(cfg: BackoffConfig) -> Self {
        match cfg {
            BackoffConfig::Fixed { delay } => RetryBackoff::Fixed(delay),
            BackoffConfig::CappedExponential { base, cap } => {
                RetryBackoff::CappedExponential { base, cap }
            }
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::CappedExponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

impl BusConfig {
    /// Load from `QBUS_`-prefixed environment variables, defaulting any
    /// that are absent.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            table_name: env_or("QBUS_TABLE_NAME", "events".to_string())?,
            nb_threads: env_parsed_or("QBUS_NB_THREADS", 4)?,
            poll_interval: Duration::from_millis(env_parsed_or("QBUS_POLL_INTERVAL_MS", 1_000)?),
            claim_batch_size: env_parsed_or("QBUS_CLAIM_BATCH_SIZE", 50)?,
            claim_lease: Duration::from_millis(env_parsed_or("QBUS_CLAIM_LEASE_MS", 30_000)?),
            max_failure_retries: env_parsed_or("QBUS_MAX_FAILURE_RETRIES", 5)?,
            retry_backoff: backoff_from_env()?,
            instance_name: env_or("QBUS_INSTANCE_NAME", default_instance_name())?,
        })
    }

    /// Load, deep-merging in order, from one or more YAML files, producing
    /// a canonical (sorted-key) JSON form and its SHA-256 hash alongside
    /// the resolved config. Later files override earlier ones.
    pub fn from_layered_yaml(paths: &[&str]) -> Result<(Self, LoadedConfig)> {
        let loaded = load_layered_yaml(paths)?;
        let config: BusConfig =
            serde_json::from_value(loaded.config_json.clone()).context("config does not match BusConfig shape")?;
        Ok((config, loaded))
    }
}

fn default_instance_name() -> String {
    format!("qbus-{}", std::process::id())
}

fn env_or(key: &str, default: String) -> Result<String> {
    match std::env::var(key) {
        Ok(v) => Ok(v),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(anyhow!("{key}: {e}")),
    }
}

fn env_parsed_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v.parse::<T>().map_err(|e| anyhow!("{key}='{v}' is not valid: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(anyhow!("{key}: {e}")),
    }
}

fn backoff_from_env() -> Result<BackoffConfig> {
    match std::env::var("QBUS_RETRY_BACKOFF_KIND").as_deref() {
        Ok("fixed") => {
            let secs: u64 = env_parsed_or("QBUS_RETRY_BACKOFF_DELAY_SECS", 5)?;
            Ok(BackoffConfig::Fixed {
                delay: Duration::from_secs(secs),
            })
        }
        Ok("capped_exponential") | Err(_) => {
            let base_secs: u64 = env_parsed_or("QBUS_RETRY_BACKOFF_BASE_SECS", 1)?;
            let cap_secs: u64 = env_parsed_or("QBUS_RETRY_BACKOFF_CAP_SECS", 60)?;
            Ok(BackoffConfig::CappedExponential {
                base: Duration::from_secs(base_secs),
                cap: Duration::from_secs(cap_secs),
            })
        }
        Ok(other) => Err(anyhow!("QBUS_RETRY_BACKOFF_KIND: unknown value '{other}'")),
    }
}

/// Deep-merged, canonicalized (sorted-key) JSON plus its SHA-256 hash, so
/// two deployments with equivalent but differently-formatted YAML agree on
/// whether their configuration matches.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
