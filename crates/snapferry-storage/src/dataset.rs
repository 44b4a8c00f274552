//! Dataset data model and name helpers.
//!
//! Dataset names are slash separated paths (`pool/fs/child`). Snapshot names
//! carry exactly one `@name` suffix naming the snapshot of the filesystem or
//! volume before the `@`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{DriverError, DriverResult};

/// Type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    /// Matches every type when listing.
    All,
    /// A mountable filesystem.
    #[default]
    Filesystem,
    /// A read-only point in time copy.
    Snapshot,
    /// A block volume.
    Volume,
}

impl DatasetType {
    /// Returns true if a dataset of type `other` passes a listing filter of this type.
    pub fn matches(&self, other: DatasetType) -> bool {
        *self == DatasetType::All || *self == other
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatasetType::All => "all",
            DatasetType::Filesystem => "filesystem",
            DatasetType::Snapshot => "snapshot",
            DatasetType::Volume => "volume",
        };
        f.write_str(s)
    }
}

/// A named storage object as reported by the driver.
///
/// The statistics mirror the fixed column set every listing returns.
/// Anything else the caller asked for lands in `extra_props`; a property that
/// is not set anywhere in the hierarchy is absent from the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    /// Full dataset name.
    pub name: String,
    /// Dataset type.
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    /// Origin snapshot for clones, empty otherwise.
    #[serde(default)]
    pub origin: String,
    /// Bytes used by the dataset and its descendants.
    #[serde(default)]
    pub used: u64,
    /// Bytes available.
    #[serde(default)]
    pub avail: u64,
    /// Mountpoint, empty for snapshots and volumes.
    #[serde(default)]
    pub mountpoint: String,
    /// Compression algorithm.
    #[serde(default)]
    pub compression: String,
    /// Bytes written since the previous snapshot.
    #[serde(default)]
    pub written: u64,
    /// Volume size, zero for non-volumes.
    #[serde(default)]
    pub volsize: u64,
    /// Logical bytes used.
    #[serde(default)]
    pub logicalused: u64,
    /// Bytes used by this dataset alone.
    #[serde(default)]
    pub usedbydataset: u64,
    /// Quota, zero when unlimited.
    #[serde(default)]
    pub quota: u64,
    /// Bytes referenced.
    #[serde(default)]
    pub referenced: u64,
    /// Requested extra properties.
    #[serde(default)]
    pub extra_props: HashMap<String, String>,
}

impl Dataset {
    /// Creates a dataset description with empty statistics.
    pub fn new(name: impl Into<String>, dataset_type: DatasetType) -> Self {
        Self {
            name: name.into(),
            dataset_type,
            ..Self::default()
        }
    }

    /// Returns true for snapshots.
    pub fn is_snapshot(&self) -> bool {
        self.dataset_type == DatasetType::Snapshot
    }

    /// Value of an extra property, treating the driver's `-` placeholder as unset.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.extra_props
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != "-")
    }

    /// The snapshot part of the name (`s1` for `pool/fs@s1`).
    pub fn snapshot_name(&self) -> Option<&str> {
        split_snapshot_name(&self.name).map(|(_, snap)| snap)
    }

    /// The filesystem part of the name (the whole name for non-snapshots).
    pub fn filesystem_name(&self) -> &str {
        split_snapshot_name(&self.name)
            .map(|(fs, _)| fs)
            .unwrap_or(&self.name)
    }
}

/// Splits `pool/fs@snap` into `("pool/fs", "snap")`.
///
/// Returns `None` when the name is not a snapshot name.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    let (fs, snap) = name.split_once('@')?;
    if fs.is_empty() || snap.is_empty() || snap.contains('@') {
        return None;
    }
    Some((fs, snap))
}

/// Joins a filesystem and a snapshot name.
pub fn snapshot_full_name(filesystem: &str, snapshot: &str) -> String {
    format!("{}@{}", filesystem, snapshot)
}

/// Parent of a filesystem (`pool` for `pool/fs`), or of a snapshot's filesystem.
pub fn parent_name(name: &str) -> Option<&str> {
    let base = split_snapshot_name(name).map(|(fs, _)| fs).unwrap_or(name);
    base.rsplit_once('/').map(|(parent, _)| parent)
}

/// Name relative to `parent` (`fs@s1` for `pool/fs@s1` under `pool`).
///
/// Names outside `parent` are returned unchanged.
pub fn strip_parent<'a>(parent: &str, name: &'a str) -> &'a str {
    if parent.is_empty() {
        return name;
    }
    match name.strip_prefix(parent) {
        Some(rest) if rest.starts_with('/') => &rest[1..],
        _ => name,
    }
}

/// Joins a parent dataset and a logical name.
pub fn join_parent(parent: &str, logical: &str) -> String {
    if parent.is_empty() {
        logical.to_string()
    } else {
        format!("{}/{}", parent, logical)
    }
}

/// Checks a dataset name for empty components and stray `@` characters.
pub fn validate_name(name: &str) -> DriverResult<()> {
    let invalid = || DriverError::InvalidName {
        name: name.to_string(),
    };
    let (path, snap) = match name.split_once('@') {
        Some((path, snap)) => (path, Some(snap)),
        None => (name, None),
    };
    if path.is_empty() || path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(invalid());
    }
    if let Some(snap) = snap {
        if snap.is_empty() || snap.contains('@') || snap.contains('/') {
            return Err(invalid());
        }
    }
    Ok(())
}
