//! Shared wire and data-model types for the KubeArchive sink.
//!
//! Mirrors the resource/log-url/policy records from the data model section of
//! the spec this workspace implements, plus the CloudEvent envelope shape the
//! sink accepts on ingress.

use serde::{Deserialize, Serialize};

/// Reserved namespace key used for the global policy fallback tier.
pub const GLOBAL_NAMESPACE: &str = "_global";

/// A Kubernetes `group/version, kind` pair as carried on the wire.
///
/// `api_version` is stored exactly as seen (`"v1"` for the core group,
/// `"batch/v1"` otherwise) rather than split into group/version, since that is
/// how both CloudEvent extensions and policy selectors express it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub api_version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Gvk {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// `apiVersion/kind`, the canonical display form used in metrics labels
    /// and log lines.
    pub fn resource_type(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

/// One row of the `resource` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub uid: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Unix epoch milliseconds; last time we observed a change for this uid.
    pub cluster_updated_ts: i64,
    /// Unix epoch milliseconds; set once the delete notification has been
    /// processed.
    pub cluster_deleted_ts: Option<i64>,
    pub data: serde_json::Value,
    /// Derived from `metadata.creationTimestamp`, unix epoch milliseconds.
    pub created_at: i64,
}

/// One row of the `log_url` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogUrlRecord {
    pub uid: String,
    pub url: String,
    pub container_name: String,
    pub json_path: String,
}

/// Result of `ResourceWriter::write`. Infrastructure failures are returned
/// as `Err`, not as a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The stale-event no-op path: `cluster_updated_ts` guard rejected the
    /// write. Not an error.
    None,
}

/// Result of `ClusterDeleter::delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The object was already gone; treated as success.
    NotFound,
}

/// The `result` label on the single counter increment every request emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Insert,
    Update,
    None,
    NoMatch,
    NoConf,
    Error,
}

impl EventResult {
    pub fn as_str(self) -> &'static str {
        match self {
            EventResult::Insert => "insert",
            EventResult::Update => "update",
            EventResult::None => "none",
            EventResult::NoMatch => "no_match",
            EventResult::NoConf => "no_conf",
            EventResult::Error => "error",
        }
    }
}

impl From<WriteOutcome> for EventResult {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Inserted => EventResult::Insert,
            WriteOutcome::Updated => EventResult::Update,
            WriteOutcome::None => EventResult::None,
        }
    }
}

/// A parsed CloudEvent envelope, structured or binary mode.
///
/// Only the envelope attributes this sink actually consumes are modeled; any
/// other CloudEvents extension attribute is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub apiversion: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl CloudEvent {
    /// An event whose type ends with `.delete` is a deletion notification;
    /// anything else is add/modify.
    pub fn is_delete(&self) -> bool {
        self.event_type.ends_with(".delete")
    }
}

/// A Kubernetes object extracted from a CloudEvent's `data` payload.
///
/// Thin accessor layer over the raw JSON so the rest of the pipeline never
/// has to repeat `obj["metadata"]["uid"]`-style indexing.
#[derive(Debug, Clone)]
pub struct KubeResource {
    pub raw: serde_json::Value,
}

impl KubeResource {
    pub fn from_value(raw: serde_json::Value) -> Option<Self> {
        let obj = KubeResource { raw };
        if obj.uid().is_some()
            && obj.name().is_some()
            && obj.namespace().is_some()
            && obj.kind().is_some()
            && obj.api_version().is_some()
        {
            Some(obj)
        } else {
            None
        }
    }

    fn str_field(&self, path: &[&str]) -> Option<&str> {
        let mut cur = &self.raw;
        for segment in path {
            cur = cur.get(segment)?;
        }
        cur.as_str()
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_field(&["metadata", "uid"])
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field(&["metadata", "name"])
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_field(&["metadata", "namespace"])
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_field(&["kind"])
    }

    pub fn api_version(&self) -> Option<&str> {
        self.str_field(&["apiVersion"])
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.str_field(&["metadata", "resourceVersion"])
    }

    pub fn creation_timestamp(&self) -> Option<&str> {
        self.str_field(&["metadata", "creationTimestamp"])
    }

    pub fn gvk(&self) -> Option<Gvk> {
        Some(Gvk::new(self.api_version()?, self.kind()?))
    }

    pub fn is_pod(&self) -> bool {
        self.kind() == Some("Pod")
    }

    /// Stamps `metadata.deletionTimestamp` with the given RFC3339 timestamp,
    /// returning a new owned value (used for the post-delete re-archive write).
    pub fn with_deletion_timestamp(&self, ts_rfc3339: &str) -> serde_json::Value {
        let mut out = self.raw.clone();
        if let Some(metadata) = out.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.insert(
                "deletionTimestamp".to_string(),
                serde_json::Value::String(ts_rfc3339.to_string()),
            );
        }
        out
    }
}
