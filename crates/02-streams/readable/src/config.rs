//! Per-realm configuration injected at construction time.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::source::ExternalSourceHost;

fn default_label() -> String {
    "main".to_string()
}

/// Configuration for a [`Realm`](crate::Realm).
#[derive(Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    /// Label used for the realm's domain and task queue.
    #[serde(default = "default_label")]
    pub label: String,
    /// Host callback set backing external byte sources. Installed once per
    /// realm; streams created with [`ReadableStream::new_external`] use it.
    ///
    /// [`ReadableStream::new_external`]: crate::ReadableStream::new_external
    #[serde(skip)]
    pub external_host: Option<Rc<dyn ExternalSourceHost>>,
}

impl RealmConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            external_host: None,
        }
    }

    pub fn with_external_host(mut self, host: Rc<dyn ExternalSourceHost>) -> Self {
        self.external_host = Some(host);
        self
    }
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self::new(default_label())
    }
}

impl fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmConfig")
            .field("label", &self.label)
            .field("external_host", &self.external_host.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: RealmConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.label, "main");
        assert!(config.external_host.is_none());

        let named: RealmConfig = serde_json::from_str(r#"{"label": "worker"}"#).unwrap();
        assert_eq!(named.label, "worker");
    }
}
