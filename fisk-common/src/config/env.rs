//! Environment variable parsing with type safety.
//!
//! Provides a parser for the `FISK_*` variables that collects errors instead
//! of failing, so a typo in the environment never stops a compile.

use super::source::Sourced;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },
}

type Lookup = Box<dyn Fn(&str) -> Option<String>>;

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser over the process environment with the `FISK_` prefix.
    pub fn new() -> Self {
        Self {
            prefix: "FISK_",
            lookup: Box::new(|name| std::env::var(name).ok()),
            errors: Vec::new(),
        }
    }

    /// Create a parser over a fixed set of variables.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            prefix: "FISK_",
            lookup: Box::new(move |name| vars.get(name).cloned()),
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Whether the variable is set at all, even to an empty string.
    pub fn is_set(&self, name: &str) -> bool {
        (self.lookup)(&self.var_name(name)).is_some()
    }

    /// Get a non-empty string value.
    pub fn get_string(&self, name: &str) -> Option<Sourced<String>> {
        let var_name = self.var_name(name);
        match (self.lookup)(&var_name) {
            Some(value) if !value.is_empty() => Some(Sourced::from_env(value, var_name)),
            _ => None,
        }
    }

    /// Get a path value.
    pub fn get_path(&self, name: &str) -> Option<Sourced<PathBuf>> {
        self.get_string(name).map(|s| s.map(PathBuf::from))
    }

    /// Get a boolean value.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str) -> Option<Sourced<bool>> {
        let var_name = self.var_name(name);
        let value = (self.lookup)(&var_name)?;
        let parsed = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                return None;
            }
        };
        Some(Sourced::from_env(parsed, var_name))
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
