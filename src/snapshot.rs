//! Persisted pool state and the handles it owns.
//!
//! A [`PoolSnapshot`] is the whole pool as one value. It is always replaced
//! wholesale by [`crate::store::PoolStore`]; nothing edits a stored snapshot
//! in place.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque secret used to activate a pooled resource.
///
/// The value is never printed by `Debug`.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ActivationSecret(String);

impl ActivationSecret {
    /// Wraps a raw secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw secret for handing to an activator.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ActivationSecret {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ActivationSecret(<redacted>)")
    }
}

/// Lifecycle state of a pooled resource.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Provisioned and waiting to be checked out.
    #[default]
    Ready,
}

/// One pre-provisioned environment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceHandle {
    /// Stable identifier; unique within a pool.
    pub id: String,
    /// Human readable alias shown in listings.
    pub display_alias: String,
    /// Secret needed to log into the resource later.
    pub activation_secret: ActivationSecret,
    /// When the resource was provisioned.
    pub created_at: DateTime<Utc>,
    /// Current status.
    #[serde(default)]
    pub status: ResourceStatus,
    /// Observability annotations written by the pool.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ResourceHandle {
    /// Creates a ready handle stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        display_alias: impl Into<String>,
        activation_secret: ActivationSecret,
    ) -> Self {
        Self {
            id: id.into(),
            display_alias: display_alias.into(),
            activation_secret,
            created_at: Utc::now(),
            status: ResourceStatus::Ready,
            metadata: BTreeMap::new(),
        }
    }
}

/// Where a checked-in handle is placed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InsertPosition {
    /// Next in line for checkout.
    Front,
    /// Last in line for checkout.
    #[default]
    Back,
}

/// The entire persisted pool.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolSnapshot {
    /// Incremented on every write made through the pool store.
    #[serde(default)]
    pub version: u64,
    /// Token identifying the write that produced this snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
    /// Pooled handles in checkout order.
    #[serde(default)]
    pub resources: Vec<ResourceHandle>,
}

/// Raised when a stored blob cannot be interpreted as a snapshot.
#[derive(Debug, Error)]
#[error("stored pool snapshot is malformed: {0}")]
pub struct SnapshotDecodeError(#[from] serde_json::Error);

impl PoolSnapshot {
    /// Number of pooled handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` when nothing is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns `true` when a handle with `id` is pooled.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.iter().any(|handle| handle.id == id)
    }

    /// Decodes a stored blob, dropping later duplicates of any id.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotDecodeError`] when the bytes are not a snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotDecodeError> {
        let mut snapshot: Self = serde_json::from_slice(bytes)?;
        let mut seen = HashSet::new();
        snapshot
            .resources
            .retain(|handle| seen.insert(handle.id.clone()));
        Ok(snapshot)
    }

    /// Serialises the snapshot for storage.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotDecodeError`] if serialisation fails.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotDecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Builds the successor of this snapshot tagged with `writer`.
    #[must_use]
    pub fn successor(&self, resources: Vec<ResourceHandle>, writer: String) -> Self {
        Self {
            version: self.version.saturating_add(1),
            writer: Some(writer),
            resources,
        }
    }

    /// Splits off the front handle, returning it with the remaining list.
    #[must_use]
    pub fn split_front(&self) -> Option<(ResourceHandle, Vec<ResourceHandle>)> {
        let (first, rest) = self.resources.split_first()?;
        Some((first.clone(), rest.to_vec()))
    }

    /// Returns the resource list with `handle` inserted at `position`.
    ///
    /// Returns `None` when a handle with the same id is already pooled.
    #[must_use]
    pub fn with_inserted(
        &self,
        handle: ResourceHandle,
        position: InsertPosition,
    ) -> Option<Vec<ResourceHandle>> {
        if self.contains(&handle.id) {
            return None;
        }
        let mut resources = Vec::with_capacity(self.resources.len() + 1);
        match position {
            InsertPosition::Front => {
                resources.push(handle);
                resources.extend(self.resources.iter().cloned());
            }
            InsertPosition::Back => {
                resources.extend(self.resources.iter().cloned());
                resources.push(handle);
            }
        }
        Some(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn handle(id: &str) -> ResourceHandle {
        ResourceHandle::new(id, format!("alias-{id}"), ActivationSecret::new("s3cret"))
    }

    #[test]
    fn activation_secret_debug_is_redacted() {
        let rendered = format!("{:?}", handle("a"));
        assert!(!rendered.contains("s3cret"), "secret leaked: {rendered}");
    }

    #[test]
    fn empty_snapshot_decodes_from_minimal_json() {
        let snapshot = PoolSnapshot::decode(br#"{"resources":[]}"#).expect("decode");
        assert_eq!(snapshot, PoolSnapshot::default());
    }

    #[test]
    fn decode_drops_duplicate_ids() {
        let original = PoolSnapshot {
            version: 3,
            writer: None,
            resources: vec![handle("a"), handle("b"), handle("a")],
        };
        let bytes = serde_json::to_vec(&original).expect("encode");
        let decoded = PoolSnapshot::decode(&bytes).expect("decode");
        let ids: Vec<_> = decoded.resources.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PoolSnapshot::decode(b"not json").is_err());
    }

    #[rstest]
    #[case(InsertPosition::Front, &["c", "a", "b"])]
    #[case(InsertPosition::Back, &["a", "b", "c"])]
    fn with_inserted_respects_position(#[case] position: InsertPosition, #[case] expected: &[&str]) {
        let snapshot = PoolSnapshot {
            resources: vec![handle("a"), handle("b")],
            ..PoolSnapshot::default()
        };
        let resources = snapshot
            .with_inserted(handle("c"), position)
            .expect("insert");
        let ids: Vec<_> = resources.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn with_inserted_refuses_duplicate() {
        let snapshot = PoolSnapshot {
            resources: vec![handle("a")],
            ..PoolSnapshot::default()
        };
        assert!(snapshot.with_inserted(handle("a"), InsertPosition::Back).is_none());
    }

    #[test]
    fn successor_bumps_version_and_tags_writer() {
        let snapshot = PoolSnapshot::default();
        let next = snapshot.successor(vec![handle("a")], String::from("w-1"));
        assert_eq!(next.version, 1);
        assert_eq!(next.writer.as_deref(), Some("w-1"));
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn metadata_is_omitted_when_empty() {
        let json = serde_json::to_string(&handle("a")).expect("encode");
        assert!(!json.contains("metadata"), "unexpected metadata: {json}");
    }
}
