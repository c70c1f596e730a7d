// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON manifest describing a tree of supervised processes.
//!
//! ```json
//! {
//!   "name": "nvr",
//!   "services": [
//!     { "name": "media", "path": "/usr/bin/mediaserver", "args": ["config.lua"] },
//!     { "name": "recorder", "path": "./recorder", "method": "channel",
//!       "depends_on": ["media"], "env": { "RUST_LOG": "info" } }
//!   ]
//! }
//! ```
//!
//! Every entry becomes a [`ProcessService`] child of a [`Group`] root.
//! Dependencies name sibling entries.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::error::Error;
use crate::process::{ExitPolicy, Method, ProcessArgs, ProcessService, ProcessSpec, SupervisorConfig};
use crate::service::{Dep, Group, ServiceNode};

/// Errors raised while loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error(transparent)]
    Tree(#[from] Error),
}

fn default_name() -> String {
    "vigil".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// One supervised program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: ProcessArgs,
    #[serde(default)]
    pub method: Method,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ServiceEntry {
    fn to_spec(&self) -> ProcessSpec {
        let policy = if self.auto_restart {
            ExitPolicy::AutoRestart
        } else {
            ExitPolicy::Manual
        };
        let mut spec = ProcessSpec::new(&self.name, &self.path)
            .args(self.args.clone())
            .method(self.method)
            .exit_policy(policy)
            .silent(self.silent);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        spec
    }
}

impl std::str::FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let manifest: Manifest = serde_json::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

impl Manifest {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse()
    }

    /// Check names are unique and non-empty and every dependency exists.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut names = HashSet::new();
        for entry in &self.services {
            if entry.name.trim().is_empty() {
                return Err(ManifestError::Invalid("service with an empty name".to_string()));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate service name {}",
                    entry.name
                )));
            }
        }

        for entry in &self.services {
            if let Some(missing) = entry
                .depends_on
                .iter()
                .find(|dep| !names.contains(dep.as_str()))
            {
                return Err(ManifestError::Invalid(format!(
                    "{} depends on unknown service {missing}",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Build the tree: a group root with one process child per entry.
    pub fn build(
        &self,
        bus: Arc<NotificationBus>,
        config: &SupervisorConfig,
    ) -> Result<Arc<ServiceNode>, ManifestError> {
        self.validate()?;

        let root = ServiceNode::new(Arc::new(Group::new(&self.name)), bus);
        for entry in &self.services {
            let service = ProcessService::new(entry.to_spec(), config.clone());
            let deps = entry.depends_on.iter().map(|d| Dep::from(d.as_str()));
            root.add_service(Arc::new(service), deps)?;
        }
        Ok(root)
    }
}
