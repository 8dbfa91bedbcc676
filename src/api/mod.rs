//! Declarative object model shared by every controller.
//!
//! Objects live in an external object store and are addressed by
//! workspace-qualified keys. Controllers own their object's status and never
//! touch spec.

pub mod cluster;
pub mod deployment;
pub mod key;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Common object metadata carried by every stored object.
///
/// `workspace` is the logical cluster (tenant scope) and is mandatory: the
/// core never reads or writes across workspaces.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Logical cluster (tenant scope) that owns the object
    pub workspace: String,

    /// Object name, unique within its workspace
    pub name: String,

    /// Optional namespace for namespaced objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Server-assigned unique id, stable for the object's lifetime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Opaque version token, changes on every write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Spec generation, bumped by the store on every spec change
    #[serde(default)]
    pub generation: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Condition status, mirroring the usual True/False/Unknown triple.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A durable observation about an object, kept in its status.
///
/// The recognized condition types are defined per object kind (see
/// [`deployment`] and [`cluster`]).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    pub reason: String,

    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        }
    }
}

/// Upsert a condition into a condition list.
///
/// The transition timestamp only advances when the status actually flips;
/// reason and message are refreshed in place otherwise.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
        return;
    }
    conditions.push(cond);
}

/// Find a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// True when the condition exists with status True.
pub fn condition_is_true(conditions: &[Condition], condition_type: &str) -> bool {
    get_condition(conditions, condition_type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}
