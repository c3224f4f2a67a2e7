//! Layered JSON config files.
//!
//! Files are consulted in order and the first file that defines a key wins;
//! later files are never merged into a value found earlier.

use super::ConfigError;
use super::source::{ConfigSource, Sourced};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One parsed config file.
#[derive(Debug, Clone)]
struct Layer {
    source: ConfigSource,
    values: Map<String, Value>,
}

/// Ordered stack of config files, highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    layers: Vec<Layer>,
}

impl ConfigLayers {
    /// Load every existing file in `paths`. Missing files are skipped; files
    /// that exist but cannot be read or parsed are errors.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut layers = Self::default();
        for path in paths {
            match Self::read(path)? {
                Some(values) => {
                    debug!("Loaded config from {}", path.display());
                    layers.push(ConfigSource::File(path.clone()), values);
                }
                None => debug!("No config at {}", path.display()),
            }
        }
        Ok(layers)
    }

    fn read(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        if contents.trim().is_empty() {
            return Err(ConfigError::Empty(path.to_path_buf()));
        }
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(values)) => Ok(Some(values)),
            Ok(_) => Err(ConfigError::Parse {
                path: path.to_path_buf(),
                reason: "top level must be a JSON object".to_string(),
            }),
            Err(e) => Err(ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// Append a layer with lower precedence than every existing one.
    pub fn push(&mut self, source: ConfigSource, values: Map<String, Value>) {
        self.layers.push(Layer { source, values });
    }

    /// Build layers from in-memory JSON objects, highest precedence first.
    pub fn from_values(values: Vec<(ConfigSource, Value)>) -> Self {
        let mut layers = Self::default();
        for (source, value) in values {
            if let Value::Object(map) = value {
                layers.push(source, map);
            }
        }
        layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// First non-null value for `key`.
    pub fn get(&self, key: &str) -> Option<Sourced<&Value>> {
        self.layers.iter().find_map(|layer| {
            layer
                .values
                .get(key)
                .filter(|value| !value.is_null())
                .map(|value| Sourced::new(value, layer.source.clone()))
        })
    }

    pub fn string(&self, key: &str) -> Option<Sourced<String>> {
        let found = self.get(key)?;
        match found.value {
            Value::String(s) => Some(Sourced::new(s.clone(), found.source)),
            other => {
                debug!("Ignoring {} from {}: expected a string, got {}", key, found.source, other);
                None
            }
        }
    }

    pub fn integer(&self, key: &str) -> Option<Sourced<i64>> {
        let found = self.get(key)?;
        match found.value.as_i64() {
            Some(n) => Some(Sourced::new(n, found.source)),
            None => {
                debug!("Ignoring {} from {}: expected an integer", key, found.source);
                None
            }
        }
    }

    pub fn boolean(&self, key: &str) -> Option<Sourced<bool>> {
        let found = self.get(key)?;
        match found.value.as_bool() {
            Some(b) => Some(Sourced::new(b, found.source)),
            None => {
                debug!("Ignoring {} from {}: expected a boolean", key, found.source);
                None
            }
        }
    }
}
