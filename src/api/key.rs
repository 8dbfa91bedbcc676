//! Workspace-qualified work-queue keys.
//!
//! Every queue entry is a key of the form `workspace|name` for
//! workspace-scoped objects or `workspace|namespace/name` for namespaced
//! ones. The `|` separator is bit-exact; the workspace is carried verbatim so
//! events from different tenants never coalesce onto the same entry.

use crate::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key {0:?} is missing the '|' workspace separator")]
    MissingSeparator(String),

    #[error("key {0:?} has an empty workspace")]
    EmptyWorkspace(String),

    #[error("key {0:?} has an empty name")]
    EmptyName(String),
}

/// Canonical identifier for an object on a work queue.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub workspace: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl Key {
    /// Build a workspace-scoped key.
    pub fn workspace_scoped(workspace: &str, name: &str) -> Self {
        Key {
            workspace: workspace.to_string(),
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Build a namespaced key.
    pub fn namespaced(workspace: &str, namespace: &str, name: &str) -> Self {
        Key {
            workspace: workspace.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Compute the canonical key for an object from its metadata.
    pub fn for_object(meta: &ObjectMeta) -> Self {
        Key {
            workspace: meta.workspace.clone(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }

    /// Parse a canonical key string.
    ///
    /// Total over all inputs: every string either parses or yields a
    /// [`KeyError`], never a panic. The first `|` splits workspace from the
    /// rest; a `/` in the remainder splits namespace from name.
    ///
    /// # Examples
    /// ```
    /// use lautta::api::key::Key;
    ///
    /// let k = Key::parse("tenant-a|payments/api").unwrap();
    /// assert_eq!(k.workspace, "tenant-a");
    /// assert_eq!(k.namespace.as_deref(), Some("payments"));
    /// assert_eq!(k.name, "api");
    /// ```
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (workspace, rest) = raw
            .split_once('|')
            .ok_or_else(|| KeyError::MissingSeparator(raw.to_string()))?;

        if workspace.is_empty() {
            return Err(KeyError::EmptyWorkspace(raw.to_string()));
        }

        let (namespace, name) = match rest.split_once('/') {
            Some((ns, n)) => (Some(ns.to_string()), n),
            None => (None, rest),
        };

        if name.is_empty() {
            return Err(KeyError::EmptyName(raw.to_string()));
        }

        Ok(Key {
            workspace: workspace.to_string(),
            namespace,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}|{}/{}", self.workspace, ns, self.name),
            None => write!(f, "{}|{}", self.workspace, self.name),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "key_test.rs"]
mod tests;
