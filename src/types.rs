//! Data structures replicated between gossiping nodes.
//!
//! A [`MeshEntry`] is the unit of replicated state: the declared target
//! group of one named job, stamped with the time it was declared.  Entries
//! are serialised using [`serde`](https://serde.rs/) and spread over the
//! gossip network, where the newest entry for a name always wins.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the targets of a job should be monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Active,
    /// Tombstone of a removed job.  It is kept around so the removal
    /// out-ranks older `Active` copies still travelling through the mesh.
    Inactive,
}

/// A set of addresses sharing the same labels, in the shape Prometheus
/// file based service discovery uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// The declared state of one job.
///
/// Entries are never modified after construction, the store swaps whole
/// entries when a newer one arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshEntry {
    pub name: String,
    pub status: Status,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<TargetGroup>,
}

impl MeshEntry {
    pub fn active(name: impl Into<String>, updated: DateTime<Utc>, group: TargetGroup) -> Self {
        Self {
            name: name.into(),
            status: Status::Active,
            updated,
            target_group: Some(group),
        }
    }

    pub fn inactive(name: impl Into<String>, updated: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: Status::Inactive,
            updated,
            target_group: None,
        }
    }

    /// Tombstones never carry targets, whatever the sender put on the wire.
    pub fn normalize(mut self) -> Self {
        if self.status == Status::Inactive {
            self.target_group = None;
        }
        self
    }

    pub fn targets(&self) -> &[String] {
        self.target_group
            .as_ref()
            .map(|group| group.targets.as_slice())
            .unwrap_or_default()
    }
}
