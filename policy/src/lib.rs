//! In-memory policy cache: a hot-reloadable map from `(namespace, GVK)` to a
//! triple of compiled CEL expressions, with a reserved `_global` fallback
//! tier.
//!
//! Modeled as an atomic pointer to an immutable snapshot rather than a
//! reader-writer lock around a mutable map: readers dereference once per
//! query and never hold a lock across CEL evaluation, and a reload builds
//! the entire next snapshot off to the side before swapping it in, so no
//! reader ever observes a partially-rebuilt map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use futures::StreamExt;
use kubearchive_cel::CompiledExpression;
use kubearchive_types::{GLOBAL_NAMESPACE, Gvk, KubeResource};

/// `(namespace, GVK)`, the key under which a compiled policy is stored.
/// `namespace` is either a real namespace or [`GLOBAL_NAMESPACE`].
pub type PolicyKey = (String, Gvk);

/// One resolved, compiled policy entry. Any of the three predicates may be
/// absent (not configured) or present but failed to compile at the most
/// recent reload (also treated as absent, after logging).
#[derive(Clone, Default)]
pub struct CompiledPolicy {
    pub archive_when: Option<CompiledExpression>,
    pub delete_when: Option<CompiledExpression>,
    pub archive_on_delete: Option<CompiledExpression>,
}

impl CompiledPolicy {
    fn is_empty(&self) -> bool {
        self.archive_when.is_none() && self.delete_when.is_none() && self.archive_on_delete.is_none()
    }
}

/// An immutable point-in-time view of the whole policy table.
#[derive(Clone, Default)]
pub struct PolicySnapshot {
    entries: HashMap<PolicyKey, CompiledPolicy>,
}

impl PolicySnapshot {
    fn get(&self, namespace: &str, gvk: &Gvk) -> Option<&CompiledPolicy> {
        self.entries.get(&(namespace.to_string(), gvk.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to parse policy YAML for configmap key {key}: {source}")]
    Yaml {
        key: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Raw shape of one policy record as it appears in the ConfigMap's YAML,
/// one list of these per data key (one key per namespace, plus `_global`).
#[derive(Debug, Deserialize)]
struct RawRecord {
    selector: RawSelector,
    #[serde(default)]
    #[serde(rename = "archiveWhen")]
    archive_when: Option<String>,
    #[serde(default)]
    #[serde(rename = "deleteWhen")]
    delete_when: Option<String>,
    #[serde(default)]
    #[serde(rename = "archiveOnDelete")]
    archive_on_delete: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSelector {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
}

fn compile_entry(namespace: &str, gvk: &Gvk, raw: &RawRecord) -> CompiledPolicy {
    let compile_one = |field: &str, source: &Option<String>| -> Option<CompiledExpression> {
        let source = source.as_ref()?;
        match CompiledExpression::compile(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                error!(
                    namespace,
                    resource_type = %gvk.resource_type(),
                    field,
                    error = %e,
                    "dropping policy field: CEL compile failed"
                );
                None
            }
        }
    };

    CompiledPolicy {
        archive_when: compile_one("archiveWhen", &raw.archive_when),
        delete_when: compile_one("deleteWhen", &raw.delete_when),
        archive_on_delete: compile_one("archiveOnDelete", &raw.archive_on_delete),
    }
}

/// Builds a whole snapshot from a ConfigMap's `data` map. Never fails the
/// whole reload: a YAML document that fails to parse logs and is skipped
/// entirely (its namespace's records are omitted for that reload), and a
/// record whose expression fails to compile drops only that field.
pub fn build_snapshot(data: &BTreeMap<String, String>) -> PolicySnapshot {
    let mut entries = HashMap::new();
    for (namespace, yaml) in data {
        let records: Vec<RawRecord> = match serde_yaml::from_str(yaml) {
            Ok(r) => r,
            Err(e) => {
                error!(namespace, error = %e, "dropping policy reload for namespace: YAML parse failed");
                continue;
            }
        };
        for raw in &records {
            let gvk = Gvk::new(raw.selector.api_version.clone(), raw.selector.kind.clone());
            let compiled = compile_entry(namespace, &gvk, raw);
            if compiled.is_empty() {
                continue;
            }
            entries.insert((namespace.clone(), gvk), compiled);
        }
    }
    PolicySnapshot { entries }
}

/// The hot-reloadable policy cache.
pub struct PolicyStore {
    inner: ArcSwap<PolicySnapshot>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        PolicyStore {
            inner: ArcSwap::from_pointee(PolicySnapshot::default()),
        }
    }

    /// Atomically replaces the whole table. Call with an empty snapshot to
    /// collapse to nothing on ConfigMap delete.
    pub fn swap(&self, snapshot: PolicySnapshot) {
        info!(entries = snapshot.entries.len(), "policy store reloaded");
        self.inner.store(Arc::new(snapshot));
    }

    /// A namespace-tier entry for `(namespace, gvk)` shadows the global tier
    /// entirely for that predicate: if the entry exists at all, its value for
    /// `pick` is returned as-is, even `None`, and global is never consulted.
    /// Only the *absence* of any namespace-tier entry falls through to
    /// global.
    fn resolve<'a>(
        &'a self,
        snapshot: &'a Arc<PolicySnapshot>,
        namespace: &str,
        gvk: &Gvk,
        pick: impl Fn(&'a CompiledPolicy) -> Option<&'a CompiledExpression>,
    ) -> Option<&'a CompiledExpression> {
        if let Some(policy) = snapshot.get(namespace, gvk) {
            return pick(policy);
        }
        if let Some(policy) = snapshot.get(GLOBAL_NAMESPACE, gvk) {
            return pick(policy);
        }
        None
    }

    /// True if `obj`'s namespace/global tier has an `archiveWhen` that
    /// evaluates true, or if [`Self::must_delete`] is true (deletion implies
    /// prior archive).
    pub fn must_archive(&self, obj: &KubeResource) -> bool {
        let snapshot = self.inner.load_full();
        let (Some(ns), Some(gvk)) = (obj.namespace(), obj.gvk()) else {
            return false;
        };
        let archive = self
            .resolve(&snapshot, ns, &gvk, |p| p.archive_when.as_ref())
            .map(|expr| expr.eval_bool(&obj.raw))
            .unwrap_or(false);
        archive || self.must_delete(obj)
    }

    pub fn must_delete(&self, obj: &KubeResource) -> bool {
        let snapshot = self.inner.load_full();
        let (Some(ns), Some(gvk)) = (obj.namespace(), obj.gvk()) else {
            return false;
        };
        self.resolve(&snapshot, ns, &gvk, |p| p.delete_when.as_ref())
            .map(|expr| expr.eval_bool(&obj.raw))
            .unwrap_or(false)
    }

    pub fn must_archive_on_delete(&self, obj: &KubeResource) -> bool {
        let snapshot = self.inner.load_full();
        let (Some(ns), Some(gvk)) = (obj.namespace(), obj.gvk()) else {
            return false;
        };
        self.resolve(&snapshot, ns, &gvk, |p| p.archive_on_delete.as_ref())
            .map(|expr| expr.eval_bool(&obj.raw))
            .unwrap_or(false)
    }

    /// Fast path: true if any policy entry at all exists for `obj`'s
    /// namespace or global tier, regardless of which predicates compiled.
    pub fn is_configured(&self, obj: &KubeResource) -> bool {
        let snapshot = self.inner.load_full();
        let (Some(ns), Some(gvk)) = (obj.namespace(), obj.gvk()) else {
            return false;
        };
        snapshot.get(ns, &gvk).is_some() || snapshot.get(GLOBAL_NAMESPACE, &gvk).is_some()
    }
}

/// Watches the policy ConfigMap and keeps `store` in sync. Runs until the
/// watch stream ends (apiserver connection loss surfaces as the stream
/// erroring, which `kube::runtime::watcher` retries internally with
/// backoff).
pub async fn watch_policy_configmap(
    store: Arc<PolicyStore>,
    client: Client,
    namespace: String,
    name: String,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let watcher_config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = Box::pin(watcher::watcher(api, watcher_config));

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(cm)) | Ok(Event::InitApply(cm)) => {
                apply_configmap(&store, &cm);
            }
            Ok(Event::Delete(cm)) => {
                warn!(configmap = %cm.name_any(), "policy configmap deleted, clearing policy store");
                store.swap(PolicySnapshot::default());
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(e) => {
                error!(error = %e, "policy configmap watch error, retrying");
            }
        }
    }
}

fn apply_configmap(store: &PolicyStore, cm: &ConfigMap) {
    let data = cm.data.clone().unwrap_or_default();
    debug!(keys = data.len(), "rebuilding policy snapshot from configmap");
    let snapshot = build_snapshot(&data);
    store.swap(snapshot);
}

/// One-shot fetch used at startup (so the store is populated before the
/// first event arrives) and by the readiness probe (so "reachable" can be
/// checked independently of the watch stream's current backoff state).
pub async fn fetch_configmap_once(
    client: &Client,
    namespace: &str,
    name: &str,
) -> kube::Result<ConfigMap> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    api.get(name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(namespace: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "namespace": namespace, "uid": "1"},
            "spec": {"containers": [{"name": "c1"}]},
        })
    }

    fn snapshot_with(entries: Vec<(&str, &str, &str, CompiledPolicy)>) -> PolicySnapshot {
        let mut map = HashMap::new();
        for (ns, api_version, kind, policy) in entries {
            map.insert((ns.to_string(), Gvk::new(api_version, kind)), policy);
        }
        PolicySnapshot { entries: map }
    }

    #[test]
    fn namespace_policy_shadows_global() {
        let store = PolicyStore::new();
        let ns_policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("false").unwrap()),
            ..Default::default()
        };
        let global_policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![
            ("default", "v1", "Pod", ns_policy),
            (GLOBAL_NAMESPACE, "v1", "Pod", global_policy),
        ]));

        let obj = KubeResource::from_value(pod("default")).unwrap();
        assert!(!store.must_archive(&obj));
    }

    #[test]
    fn namespace_entry_shadows_global_even_for_an_unset_predicate() {
        let store = PolicyStore::new();
        let ns_policy = CompiledPolicy {
            delete_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        let global_policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![
            ("default", "v1", "Pod", ns_policy),
            (GLOBAL_NAMESPACE, "v1", "Pod", global_policy),
        ]));

        let obj = KubeResource::from_value(pod("default")).unwrap();
        // The namespace entry exists, so its missing `archiveWhen` shadows
        // global's `archiveWhen = true` rather than falling through to it.
        // `must_archive` still ends up true here only because `must_delete`
        // (also namespace-scoped) independently matches.
        assert!(store.must_delete(&obj));
        assert!(store.must_archive(&obj));
    }

    #[test]
    fn namespace_entry_shadows_global_archive_when_delete_when_is_unset_too() {
        let store = PolicyStore::new();
        let ns_policy = CompiledPolicy {
            archive_on_delete: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        let global_policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![
            ("default", "v1", "Pod", ns_policy),
            (GLOBAL_NAMESPACE, "v1", "Pod", global_policy),
        ]));

        let obj = KubeResource::from_value(pod("default")).unwrap();
        // Namespace entry exists with no `archiveWhen` and no `deleteWhen`;
        // global's `archiveWhen = true` must not leak through.
        assert!(!store.must_archive(&obj));
    }

    #[test]
    fn global_fallback_when_namespace_unset() {
        let store = PolicyStore::new();
        let global_policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![(GLOBAL_NAMESPACE, "v1", "Pod", global_policy)]));

        let obj = KubeResource::from_value(pod("other")).unwrap();
        assert!(store.must_archive(&obj));
    }

    #[test]
    fn delete_implies_archive() {
        let store = PolicyStore::new();
        let policy = CompiledPolicy {
            delete_when: Some(CompiledExpression::compile("true").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![("default", "v1", "Pod", policy)]));

        let obj = KubeResource::from_value(pod("default")).unwrap();
        assert!(store.must_delete(&obj));
        assert!(store.must_archive(&obj));
    }

    #[test]
    fn is_configured_true_without_any_predicate_evaluating_true() {
        let store = PolicyStore::new();
        let policy = CompiledPolicy {
            archive_when: Some(CompiledExpression::compile("false").unwrap()),
            ..Default::default()
        };
        store.swap(snapshot_with(vec![("default", "v1", "Pod", policy)]));

        let obj = KubeResource::from_value(pod("default")).unwrap();
        assert!(store.is_configured(&obj));
        assert!(!store.must_archive(&obj));
    }

    #[test]
    fn unconfigured_resource_is_not_configured() {
        let store = PolicyStore::new();
        let obj = KubeResource::from_value(pod("default")).unwrap();
        assert!(!store.is_configured(&obj));
        assert!(!store.must_archive(&obj));
    }

    #[test]
    fn malformed_yaml_skips_namespace_without_aborting_reload() {
        let mut data = BTreeMap::new();
        data.insert("default".to_string(), "not: [valid".to_string());
        data.insert(
            GLOBAL_NAMESPACE.to_string(),
            "- selector:\n    apiVersion: v1\n    kind: Pod\n  archiveWhen: \"true\"\n".to_string(),
        );
        let snapshot = build_snapshot(&data);
        assert!(snapshot.get("default", &Gvk::new("v1", "Pod")).is_none());
        assert!(snapshot.get(GLOBAL_NAMESPACE, &Gvk::new("v1", "Pod")).is_some());
    }

    #[test]
    fn compile_failure_drops_only_that_field() {
        let mut data = BTreeMap::new();
        data.insert(
            "default".to_string(),
            "- selector:\n    apiVersion: v1\n    kind: Pod\n  archiveWhen: \"(((\"\n  deleteWhen: \"true\"\n"
                .to_string(),
        );
        let snapshot = build_snapshot(&data);
        let policy = snapshot.get("default", &Gvk::new("v1", "Pod")).unwrap();
        assert!(policy.archive_when.is_none());
        assert!(policy.delete_when.is_some());
    }
}
