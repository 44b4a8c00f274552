//! Coordination properties.
//!
//! Cooperating processes signal intent to each other through user properties
//! stored on the datasets themselves: any host that can read a dataset can see
//! that a snapshot is scheduled for deletion or is being sent. This module holds
//! the property names and the pure state transitions over them; the actual
//! writes go through the storage driver like any other property mutation.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::Dataset;

/// A coordination property holds a value that cannot be interpreted.
///
/// This is never skipped silently: it means an operator or another tool wrote
/// garbage into the control plane.
#[derive(Debug, Error)]
#[error("malformed property {property}={value:?} on {dataset}: {reason}")]
pub struct PropertyError {
    /// Dataset carrying the property.
    pub dataset: String,
    /// Property name.
    pub property: String,
    /// The raw value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Names of the coordination properties.
///
/// User properties need a `module:property` form, so every default is
/// namespaced with `snapferry:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyNames {
    /// RFC3339 time after which the dataset may be destroyed.
    pub delete_at: String,
    /// Snapshot currently being transmitted from this filesystem.
    pub sending_snapshot: String,
    /// Minutes between automatic snapshots of a filesystem.
    pub snapshot_interval_minutes: String,
    /// Number of newest snapshots to keep.
    pub snapshot_retention_count: String,
    /// Minutes a snapshot is kept.
    pub snapshot_retention_minutes: String,
    /// Base URL of the remote server to replicate to.
    pub snapshot_send_to: String,
    /// RFC3339 creation stamp written on snapshots the runner makes.
    pub snapshot_created: String,
    /// RFC3339 stamp written after a snapshot was sent.
    pub snapshot_sent_at: String,
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            delete_at: "snapferry:delete-at".to_string(),
            sending_snapshot: "snapferry:sending-snapshot".to_string(),
            snapshot_interval_minutes: "snapferry:snapshot-interval-minutes".to_string(),
            snapshot_retention_count: "snapferry:snapshot-retention-count".to_string(),
            snapshot_retention_minutes: "snapferry:snapshot-retention-minutes".to_string(),
            snapshot_send_to: "snapferry:snapshot-send-to".to_string(),
            snapshot_created: "snapferry:snapshot-created".to_string(),
            snapshot_sent_at: "snapferry:snapshot-sent-at".to_string(),
        }
    }
}

impl PropertyNames {
    /// Properties the runner needs when looking at filesystems.
    pub fn filesystem_props(&self) -> Vec<String> {
        vec![
            self.sending_snapshot.clone(),
            self.snapshot_interval_minutes.clone(),
            self.snapshot_retention_count.clone(),
            self.snapshot_retention_minutes.clone(),
            self.snapshot_send_to.clone(),
        ]
    }

    /// Properties the runner needs when looking at snapshots.
    pub fn snapshot_props(&self) -> Vec<String> {
        vec![
            self.delete_at.clone(),
            self.snapshot_created.clone(),
            self.snapshot_sent_at.clone(),
            crate::driver::PROPERTY_CREATION.to_string(),
        ]
    }
}

/// Formats a timestamp the way every time property is stored.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reads an RFC3339 time property. Unset is `Ok(None)`, garbage is an error.
pub fn parse_time_property(
    ds: &Dataset,
    property: &str,
) -> Result<Option<DateTime<Utc>>, PropertyError> {
    let Some(value) = ds.prop(property) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| PropertyError {
            dataset: ds.name.clone(),
            property: property.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Reads a non-negative integer property. Unset is `Ok(None)`.
pub fn parse_count_property(ds: &Dataset, property: &str) -> Result<Option<u64>, PropertyError> {
    let Some(value) = ds.prop(property) else {
        return Ok(None);
    };
    value.trim().parse::<u64>().map(Some).map_err(|e| PropertyError {
        dataset: ds.name.clone(),
        property: property.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// When a snapshot was made: the runner's own stamp, else the driver's
/// native `creation` (unix seconds).
pub fn snapshot_created_at(
    ds: &Dataset,
    names: &PropertyNames,
) -> Result<Option<DateTime<Utc>>, PropertyError> {
    if let Some(t) = parse_time_property(ds, &names.snapshot_created)? {
        return Ok(Some(t));
    }
    match parse_count_property(ds, crate::driver::PROPERTY_CREATION)? {
        Some(secs) => Ok(DateTime::from_timestamp(secs as i64, 0)),
        None => Ok(None),
    }
}

/// Value to write into `deleteAt`, if any.
///
/// The first mark wins: once a deadline exists it is never replaced, so a
/// policy change cannot make the deadline flap or move earlier.
pub fn next_delete_at(
    existing: Option<DateTime<Utc>>,
    proposed: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match existing {
        Some(_) => None,
        None => Some(proposed),
    }
}

/// Returns true once `delete_at` has passed.
pub fn is_due(delete_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    delete_at <= now
}

/// Returns true if a filesystem with the given newest snapshot needs a new one.
pub fn snapshot_due(
    last_created: Option<DateTime<Utc>>,
    interval_minutes: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_created {
        None => true,
        Some(last) => last + Duration::minutes(interval_minutes as i64) <= now,
    }
}

/// Retention rules of one filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep this many of the newest snapshots.
    pub keep_count: Option<u64>,
    /// Keep snapshots younger than this many minutes.
    pub keep_minutes: Option<u64>,
    /// Snapshots must have been sent before they can be pruned.
    pub require_sent: bool,
}

impl RetentionPolicy {
    /// Returns true if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.keep_count.is_none() && self.keep_minutes.is_none()
    }
}

/// What the mark pass needs to know about a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotState {
    /// Full snapshot name.
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Whether the snapshot reached the remote.
    pub sent: bool,
}

/// Names of the snapshots the policy allows to prune.
///
/// A snapshot is prunable if any configured rule selects it. The newest
/// snapshot is never prunable, it is the base of the next incremental send.
pub fn prunable_snapshots(
    snapshots: &[SnapshotState],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    if policy.is_empty() || snapshots.len() < 2 {
        return Vec::new();
    }
    let mut sorted: Vec<&SnapshotState> = snapshots.iter().collect();
    sorted.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));

    sorted
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(idx, snap)| {
            let by_count = policy
                .keep_count
                .map(|keep| (*idx as u64) >= keep)
                .unwrap_or(false);
            let by_age = policy
                .keep_minutes
                .map(|mins| snap.created + Duration::minutes(mins as i64) <= now)
                .unwrap_or(false);
            by_count || by_age
        })
        .filter(|(_, snap)| !policy.require_sent || snap.sent)
        .map(|(_, snap)| snap.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetType;

    fn snap(name: &str, minutes_ago: i64, now: DateTime<Utc>, sent: bool) -> SnapshotState {
        SnapshotState {
            name: name.to_string(),
            created: now - Duration::minutes(minutes_ago),
            sent,
        }
    }

    #[test]
    fn first_mark_wins() {
        let now = Utc::now();
        let later = now + Duration::hours(1);
        let earlier = now - Duration::hours(1);
        assert_eq!(next_delete_at(None, later), Some(later));
        assert_eq!(next_delete_at(Some(later), earlier), None);
        assert_eq!(next_delete_at(Some(earlier), later), None);
    }

    #[test]
    fn time_property_round_trip_and_garbage() {
        let names = PropertyNames::default();
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut ds = Dataset::new("pool/fs@s1", DatasetType::Snapshot);
        assert_eq!(parse_time_property(&ds, &names.delete_at).unwrap(), None);

        ds.extra_props.insert(names.delete_at.clone(), format_time(now));
        assert_eq!(parse_time_property(&ds, &names.delete_at).unwrap(), Some(now));

        ds.extra_props.insert(names.delete_at.clone(), "tomorrow".into());
        let err = parse_time_property(&ds, &names.delete_at).unwrap_err();
        assert_eq!(err.value, "tomorrow");
        assert_eq!(err.dataset, "pool/fs@s1");
    }

    #[test]
    fn created_at_falls_back_to_native_creation() {
        let names = PropertyNames::default();
        let mut ds = Dataset::new("pool/fs@s1", DatasetType::Snapshot);
        ds.extra_props
            .insert(crate::driver::PROPERTY_CREATION.into(), "1700000000".into());
        let t = snapshot_created_at(&ds, &names).unwrap().unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);

        ds.extra_props.insert(
            names.snapshot_created.clone(),
            "2024-01-01T00:00:00Z".into(),
        );
        let t = snapshot_created_at(&ds, &names).unwrap().unwrap();
        assert_eq!(format_time(t), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn due_checks() {
        let now = Utc::now();
        assert!(is_due(now, now));
        assert!(!is_due(now + Duration::seconds(1), now));
        assert!(snapshot_due(None, 60, now));
        assert!(snapshot_due(Some(now - Duration::minutes(61)), 60, now));
        assert!(!snapshot_due(Some(now - Duration::minutes(10)), 60, now));
    }

    #[test]
    fn keep_count_prunes_older_generations() {
        let now = Utc::now();
        let snaps = vec![
            snap("pool/fs@s1", 30, now, true),
            snap("pool/fs@s2", 20, now, true),
            snap("pool/fs@s3", 10, now, true),
        ];
        let policy = RetentionPolicy {
            keep_count: Some(2),
            ..Default::default()
        };
        assert_eq!(prunable_snapshots(&snaps, &policy, now), vec!["pool/fs@s1"]);
    }

    #[test]
    fn ttl_never_prunes_newest() {
        let now = Utc::now();
        let snaps = vec![
            snap("pool/fs@s1", 300, now, true),
            snap("pool/fs@s2", 200, now, true),
        ];
        let policy = RetentionPolicy {
            keep_minutes: Some(60),
            ..Default::default()
        };
        assert_eq!(prunable_snapshots(&snaps, &policy, now), vec!["pool/fs@s1"]);
    }

    #[test]
    fn unsent_snapshots_are_kept() {
        let now = Utc::now();
        let snaps = vec![
            snap("pool/fs@s1", 30, now, false),
            snap("pool/fs@s2", 20, now, true),
            snap("pool/fs@s3", 10, now, true),
        ];
        let policy = RetentionPolicy {
            keep_count: Some(1),
            require_sent: true,
            ..Default::default()
        };
        assert_eq!(prunable_snapshots(&snaps, &policy, now), vec!["pool/fs@s2"]);
    }

    #[test]
    fn empty_policy_prunes_nothing() {
        let now = Utc::now();
        let snaps = vec![snap("pool/fs@s1", 30, now, true), snap("pool/fs@s2", 1, now, true)];
        assert!(prunable_snapshots(&snaps, &RetentionPolicy::default(), now).is_empty());
    }
}
