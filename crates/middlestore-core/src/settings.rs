//! Object store settings.

use serde::{Deserialize, Serialize};

use crate::error::{Result, config_error};

/// Behavior switches for an [`ObjectStore`](crate::store::ObjectStore).
///
/// Loadable from JSON; missing keys take their defaults.
///
/// ```
/// use middlestore_core::StoreSettings;
///
/// let settings = StoreSettings::from_json_str(r#"{"threaded": false}"#).unwrap();
/// assert!(!settings.threaded);
/// assert!(!settings.cache_objects_forever);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Track pending changes per thread. When false all threads share them.
    pub threaded: bool,
    /// Keep every fetched object alive instead of letting unused ones drop.
    pub cache_objects_forever: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            threaded: true,
            cache_objects_forever: false,
        }
    }
}

impl StoreSettings {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    #[must_use]
    pub fn cache_objects_forever(mut self, forever: bool) -> Self {
        self.cache_objects_forever = forever;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid store settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = StoreSettings::default();
        assert!(s.threaded);
        assert!(!s.cache_objects_forever);
    }

    #[test]
    fn test_builder() {
        let s = StoreSettings::new().threaded(false).cache_objects_forever(true);
        assert!(!s.threaded);
        assert!(s.cache_objects_forever);
    }

    #[test]
    fn test_json_rejects_unknown_keys() {
        assert!(StoreSettings::from_json_str(r#"{"Threaded": true}"#).is_err());
        let s = StoreSettings::from_json_str(r#"{"cache_objects_forever": true}"#).unwrap();
        assert!(s.threaded);
        assert!(s.cache_objects_forever);
    }
}
