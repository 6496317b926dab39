// SPDX-FileCopyrightText: 2024 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::time;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use log;
use serde_yml::Value;
use thiserror;

const SPREAD_CONF_NAME: &'static str = "spread.yaml";
const CONF_NAME: &'static str = "spread-provisioner.yaml";

/// Caller supplied property overrides, layered on top of the configuration
/// file.
pub type Overrides = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(serde_yml::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid value {value:?} of property \"{key}\" in {object}: {reason}")]
    Invalid {
        object: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// Returns the file name of the provisioner configuration.
pub fn config_file_name() -> &'static str {
    CONF_NAME
}

/// Locate the configuration file starting from the current directory.
pub fn locate(name: &str) -> Result<PathBuf, io::Error> {
    let start_dir = env::current_dir().and_then(|p| fs::canonicalize(p))?;
    match locate_from(&start_dir, name) {
        Ok(path) => Ok(path),
        Err(err) => {
            // no spread project around, try the per user location
            if let Some(dirs) = directories::ProjectDirs::from("", "", "spread-node-provisioner") {
                let user_conf = dirs.config_dir().join(name);
                log::debug!("checking {}", user_conf.display());
                if user_conf.exists() {
                    return Ok(user_conf);
                }
            }
            Err(err)
        }
    }
}

/// Walk up from start_dir looking for a directory with spread.yaml, the
/// configuration file must sit next to it.
pub fn locate_from(start_dir: &Path, name: &str) -> Result<PathBuf, io::Error> {
    let mut dir = Some(start_dir);

    while let Some(curdir) = dir {
        log::debug!("checking {}", curdir.display());
        let backend_conf = curdir.join(name);
        let spread_conf = curdir.join(SPREAD_CONF_NAME);

        if spread_conf.exists() {
            log::debug!("found spread config {}", spread_conf.display());
            if !backend_conf.exists() {
                return Err(io::Error::other(format!(
                    "config file {} not found next to {}",
                    name,
                    spread_conf.display()
                )));
            } else {
                return Ok(backend_conf);
            }
        } else {
            dir = curdir.parent();
        }
    }
    return Err(io::Error::other(format!("cannot find {SPREAD_CONF_NAME}")));
}

/// Parsed configuration file.
#[derive(serde::Deserialize, Debug, Default, Clone)]
pub struct ConfigFile {
    /// Providers, keyed by provider name.
    #[serde(default)]
    providers: HashMap<String, Value>,
    /// Node properties, keyed by node name.
    #[serde(default)]
    nodes: HashMap<String, Value>,
    /// Named lists of setup steps.
    #[serde(default)]
    setup: HashMap<String, Vec<String>>,
}

impl ConfigFile {
    pub fn load<R>(cfg: R) -> Result<ConfigFile, ConfigError>
    where
        R: io::Read,
    {
        let conf: ConfigFile = serde_yml::from_reader(cfg).map_err(ConfigError::Load)?;
        log::debug!("config: {:?}", conf);
        Ok(conf)
    }

    pub fn provider_properties(&self, name: &str) -> Result<Properties, ConfigError> {
        match self.providers.get(name) {
            Some(v) => Ok(Properties::from_value(name, v)),
            None => Err(ConfigError::NotFound(format!(
                "provider \"{}\" not found in configuration",
                name
            ))),
        }
    }

    /// Properties of a node, empty when the node is not described in the
    /// file.
    pub fn node_properties(&self, name: &str) -> Properties {
        match self.nodes.get(name) {
            Some(v) => Properties::from_value(name, v),
            None => Properties::new(name),
        }
    }

    pub fn setup_steps(&self) -> &HashMap<String, Vec<String>> {
        &self.setup
    }
}

/// Flattened string properties of a single configured object, with caller
/// overrides and backend specific keys taking precedence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    name: String,
    backend: Option<String>,
    values: BTreeMap<String, String>,
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    let scalar = |v: &Value| -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    };

    match value {
        Value::Mapping(map) => {
            for (k, v) in map.iter() {
                let key = match scalar(k) {
                    Some(k) => k,
                    None => {
                        log::warn!("ignoring non-scalar key under \"{}\"", prefix);
                        continue;
                    }
                };
                let key = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&key, v, out);
            }
        }
        Value::Sequence(seq) => {
            let items: Vec<String> = seq.iter().filter_map(scalar).collect();
            out.insert(prefix.to_string(), items.join(","));
        }
        Value::Null => {}
        other => match scalar(other) {
            Some(s) => {
                out.insert(prefix.to_string(), s);
            }
            None => log::warn!("ignoring unsupported value of \"{}\"", prefix),
        },
    }
}

impl Properties {
    pub fn new(name: &str) -> Self {
        Properties {
            name: name.to_string(),
            backend: None,
            values: BTreeMap::new(),
        }
    }

    fn from_value(name: &str, value: &Value) -> Self {
        let mut values = BTreeMap::new();
        flatten_into("", value, &mut values);
        Properties {
            name: name.to_string(),
            backend: None,
            values,
        }
    }

    /// Layer overrides on top of current values.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        for (k, v) in overrides {
            self.values.insert(k.clone(), v.clone());
        }
        self
    }

    /// Prefer `<backend>.<key>` over `<key>` on lookups.
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name under which a shared key is actually resolved.
    pub fn resolved_key(&self, key: &str) -> String {
        if let Some(backend) = &self.backend {
            let specific = format!("{}.{}", backend, key);
            if self.values.contains_key(&specific) {
                return specific;
            }
        }
        key.to_string()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&self.resolved_key(key))
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    fn invalid(&self, key: &str, value: &str, reason: impl ToString) -> ConfigError {
        ConfigError::Invalid {
            object: self.name.clone(),
            key: self.resolved_key(key),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(self.invalid(key, v, "expected a boolean")),
            },
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse::<u64>().map_err(|e| self.invalid(key, v, e)),
        }
    }

    pub fn get_size(&self, key: &str, default: ByteSize) -> Result<ByteSize, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse::<ByteSize>().map_err(|e| self.invalid(key, v, e)),
        }
    }

    /// Duration either in humantime format (`1m 30s`) or as plain seconds.
    pub fn get_duration(
        &self,
        key: &str,
        default: time::Duration,
    ) -> Result<time::Duration, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => {
                if let Ok(secs) = v.parse::<u64>() {
                    return Ok(time::Duration::from_secs(secs));
                }
                humantime::parse_duration(v).map_err(|e| self.invalid(key, v, e))
            }
        }
    }

    /// Comma separated list of ports.
    pub fn get_ports(&self, key: &str) -> Result<Vec<u16>, ConfigError> {
        match self.get(key) {
            None => Ok(vec![]),
            Some(v) => v
                .split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<u16>().map_err(|e| self.invalid(key, v, e)))
                .collect(),
        }
    }
}
