//! Common types used throughout CloudStash.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::error::KeyError;

/// Remote storage backend identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Google,
    Azure,
}

impl Provider {
    /// Tag used in configuration and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Google => "google",
            Provider::Azure => "azure",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of an object in a remote bucket or container.
///
/// Keys are stored without leading or trailing separators, so
/// `"/reports/2024/q1.csv"` and `"reports/2024/q1.csv"` name the same
/// object. The empty key is the bucket root and is only meaningful as a
/// listing prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    components: Vec<String>,
}

impl ObjectKey {
    /// The bucket root.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a key from individual components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator, or
    ///   is `.` or `..`
    pub fn from_components(components: Vec<String>) -> Result<Self, KeyError> {
        for comp in &components {
            if comp.is_empty() {
                return Err(KeyError::EmptyComponent);
            }
            if comp.contains('/') || comp.contains('\\') {
                return Err(KeyError::Separator(comp.clone()));
            }
            if comp == "." || comp == ".." {
                return Err(KeyError::RelativeSegment(comp.clone()));
            }
        }
        Ok(Self { components })
    }

    /// Parse a key string using '/' as separator.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let key = key.trim_start_matches('/').trim_end_matches('/');
        if key.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = key.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Last component of the key.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this key with a child component.
    pub fn join(&self, child: &str) -> Result<Self, KeyError> {
        let mut components = self.components.clone();
        components.push(child.to_string());
        Self::from_components(components)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The key as sent to providers, e.g. `reports/2024/q1.csv`.
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }

    /// The key as a listing prefix: empty for the root, otherwise with a
    /// trailing separator.
    pub fn as_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.as_key())
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.as_key())
    }
}

/// Secret string that is wiped from memory on drop.
#[derive(Clone, Zeroize, Deserialize)]
#[serde(transparent)]
#[zeroize(drop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} bytes])", self.0.len())
    }
}
