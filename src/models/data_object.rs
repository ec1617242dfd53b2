//! Handles passed to the data motion layer: a template bound to a store, and
//! the other kinds of object a template can be copied from.

use crate::models::{store::DataStore, template::VmTemplate};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A catalog template bound to the store it lives on (or is headed to).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TemplateOnStore {
    pub template: VmTemplate,
    pub store: DataStore,
    /// Known once the template has been installed on `store`.
    pub install_path: Option<String>,
}

impl TemplateOnStore {
    pub fn new(template: VmTemplate, store: DataStore) -> Self {
        Self {
            template,
            store,
            install_path: None,
        }
    }

    pub fn with_install_path(mut self, path: impl Into<String>) -> Self {
        self.install_path = Some(path.into());
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SnapshotInfo {
    pub id: i64,
    pub store: DataStore,
    pub install_path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VolumeInfo {
    pub id: i64,
    pub pool: DataStore,
    pub path: String,
}

/// Anything a template can be copied from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum DataObject {
    Template(TemplateOnStore),
    Snapshot(SnapshotInfo),
    Volume(VolumeInfo),
}

impl DataObject {
    /// Location of the source bytes, or `None` for a template that was never installed.
    pub fn location(&self) -> Option<String> {
        let (root, relative) = match self {
            DataObject::Template(t) => (&t.store.url, t.install_path.as_deref()?),
            DataObject::Snapshot(s) => (&s.store.url, s.install_path.as_str()),
            DataObject::Volume(v) => (&v.pool.url, v.path.as_str()),
        };
        Some(Path::new(root).join(relative).to_string_lossy().into_owned())
    }

    pub fn describe(&self) -> String {
        match self {
            DataObject::Template(t) => format!("template {}", t.template.unique_name),
            DataObject::Snapshot(s) => format!("snapshot {}", s.id),
            DataObject::Volume(v) => format!("volume {}", v.id),
        }
    }
}
