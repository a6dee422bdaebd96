//! Cache policies and the options struct that carries them.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Result};

/// Where a miss creates its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    /// Create at the context that asked. Also known as once-per-context.
    #[default]
    #[serde(alias = "once_per_context")]
    OncePerTest,
    OncePerClass,
    Singleton,
}

/// Whether descendants see values cached by their ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inheritance {
    #[default]
    Yes,
    No,
}

impl ScopePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopePolicy::OncePerTest => "once_per_test",
            ScopePolicy::OncePerClass => "once_per_class",
            ScopePolicy::Singleton => "singleton",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, ScopePolicy::OncePerTest)
    }
}

impl Inheritance {
    pub fn as_str(self) -> &'static str {
        match self {
            Inheritance::Yes => "yes",
            Inheritance::No => "no",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, Inheritance::Yes)
    }
}

impl fmt::Display for ScopePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Inheritance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "once_per_test" | "once_per_context" => Ok(ScopePolicy::OncePerTest),
            "once_per_class" => Ok(ScopePolicy::OncePerClass),
            "singleton" => Ok(ScopePolicy::Singleton),
            _ => Err(ConfigError::UnknownPolicy(s.to_string())),
        }
    }
}

impl FromStr for Inheritance {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Inheritance::Yes),
            "no" => Ok(Inheritance::No),
            _ => Err(ConfigError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Options accepted by [`crate::ScopedCache::with_options`].
///
/// Missing fields fall back to the supported pair, so `{}` is a valid
/// config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    pub scope: ScopePolicy,
    pub inheritance: Inheritance,
}

impl CacheOptions {
    pub fn new(scope: ScopePolicy, inheritance: Inheritance) -> Self {
        Self { scope, inheritance }
    }

    /// Reject every pair except `once_per_test` + `yes`.
    pub fn validate(&self) -> Result<()> {
        if !self.scope.is_supported() {
            return Err(ConfigError::UnsupportedScope(self.scope));
        }
        if !self.inheritance.is_supported() {
            return Err(ConfigError::UnsupportedInheritance(self.inheritance));
        }
        Ok(())
    }
}
