//! The per-event decision state machine: parse, validate, look up policy,
//! classify by event-type suffix, dispatch to the writer and/or the cluster
//! deleter, and map the outcome to the sink's HTTP status contract.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use kubearchive_deleter::ClusterDeleter;
use kubearchive_logurl::LogUrlBuilder;
use kubearchive_policy::PolicyStore;
use kubearchive_types::{CloudEvent, DeleteOutcome, EventResult, Gvk, KubeResource, WriteOutcome};
use kubearchive_writer::{ResourceWriter, WriteInput};

use crate::cloudevent;

#[derive(Clone)]
pub struct AppState {
    pub writer: Arc<dyn ResourceWriter>,
    pub policy: Arc<PolicyStore>,
    pub log_url_builder: Option<Arc<LogUrlBuilder>>,
    pub deleter: Arc<ClusterDeleter>,
}

pub async fn ingest(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let event = match cloudevent::parse(&headers, &body) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, "malformed cloudevent envelope");
            return respond(StatusCode::BAD_REQUEST, "unknown", "unknown", EventResult::Error);
        }
    };

    if !cloudevent::is_valid_envelope(&event) {
        return respond(StatusCode::BAD_REQUEST, &event.event_type, "unknown", EventResult::Error);
    }

    let Some(raw_data) = event.data.clone() else {
        return respond(
            StatusCode::UNPROCESSABLE_ENTITY,
            &event.event_type,
            "unknown",
            EventResult::Error,
        );
    };

    let Some(obj) = KubeResource::from_value(raw_data) else {
        return respond(
            StatusCode::UNPROCESSABLE_ENTITY,
            &event.event_type,
            "unknown",
            EventResult::Error,
        );
    };

    let resource_type = obj
        .gvk()
        .map(|g| g.resource_type())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.policy.is_configured(&obj) {
        return respond(StatusCode::ACCEPTED, &event.event_type, &resource_type, EventResult::NoConf);
    }

    if event.is_delete() {
        handle_delete(&state, &event, &obj, &resource_type).await
    } else {
        handle_modify(&state, &event, &obj, &resource_type).await
    }
}

async fn handle_delete(
    state: &AppState,
    event: &CloudEvent,
    obj: &KubeResource,
    resource_type: &str,
) -> Response {
    if !state.policy.must_archive_on_delete(obj) {
        return respond(StatusCode::ACCEPTED, &event.event_type, resource_type, EventResult::NoMatch);
    }

    match write_resource(state, obj, Some(now_millis()), 0).await {
        Ok(outcome) => respond(StatusCode::ACCEPTED, &event.event_type, resource_type, outcome.into()),
        Err(e) => {
            tracing::error!(error = %e, "archive-on-delete write failed");
            respond(StatusCode::INTERNAL_SERVER_ERROR, &event.event_type, resource_type, EventResult::Error)
        }
    }
}

async fn handle_modify(
    state: &AppState,
    event: &CloudEvent,
    obj: &KubeResource,
    resource_type: &str,
) -> Response {
    if !state.policy.must_archive(obj) {
        return respond(StatusCode::ACCEPTED, &event.event_type, resource_type, EventResult::NoMatch);
    }

    let first_outcome = match write_resource(state, obj, None, 0).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "resource write failed");
            return respond(StatusCode::INTERNAL_SERVER_ERROR, &event.event_type, resource_type, EventResult::Error);
        }
    };

    if !state.policy.must_delete(obj) {
        return respond(StatusCode::ACCEPTED, &event.event_type, resource_type, first_outcome.into());
    }

    let Some(gvk) = obj.gvk() else {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, &event.event_type, resource_type, EventResult::Error);
    };
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name().unwrap_or_default();

    match state.deleter.delete(&gvk, namespace, name).await {
        Ok(DeleteOutcome::Deleted) | Ok(DeleteOutcome::NotFound) => {}
        Err(e) => {
            tracing::error!(error = %e, "cluster delete failed");
            return respond(StatusCode::INTERNAL_SERVER_ERROR, &event.event_type, resource_type, EventResult::Error);
        }
    }

    let deletion_ts = chrono::Utc::now().to_rfc3339();
    let deleted_value = obj.with_deletion_timestamp(&deletion_ts);
    let deleted_obj =
        KubeResource::from_value(deleted_value).expect("stamping deletionTimestamp keeps required fields intact");

    // `with_deletion_timestamp` doesn't touch `resourceVersion`, so this write's
    // resourceVersion-derived `cluster_updated_ts` would otherwise equal the
    // first write's exactly and be rejected as stale by the writer's `<`
    // guard. Bump it by one so the second write is guaranteed to register.
    if let Err(e) = write_resource(state, &deleted_obj, Some(now_millis()), 1).await {
        tracing::error!(error = %e, "post-delete archive write failed");
        return respond(StatusCode::INTERNAL_SERVER_ERROR, &event.event_type, resource_type, EventResult::Error);
    }

    respond(StatusCode::ACCEPTED, &event.event_type, resource_type, first_outcome.into())
}

/// Derives the row's `cluster_updated_ts` from the object's own
/// `resourceVersion` rather than ingestion wall-clock, so that a true
/// redelivery of the same event (same resourceVersion) collapses to the
/// writer's `None` outcome instead of winning a race against itself.
fn cluster_updated_ts(obj: &KubeResource) -> i64 {
    obj.resource_version()
        .and_then(|rv| rv.parse::<i64>().ok())
        .unwrap_or_else(now_millis)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `ts_bump` is added on top of the resourceVersion-derived `cluster_updated_ts`.
/// It exists for the post-delete re-archive write, which reuses the same
/// object (and hence the same resourceVersion) as the write that preceded
/// it in the same request; without a bump the writer's strictly-greater
/// staleness guard would reject it as a no-op.
async fn write_resource(
    state: &AppState,
    obj: &KubeResource,
    cluster_deleted_ts: Option<i64>,
    ts_bump: i64,
) -> Result<WriteOutcome, kubearchive_writer::WriteError> {
    let gvk = obj.gvk().unwrap_or_else(|| Gvk::new("", ""));
    let namespace = obj.namespace().unwrap_or("");
    let name = obj.name().unwrap_or("");
    let uid = obj.uid().unwrap_or("");
    let resource_version = obj.resource_version().unwrap_or("");
    let created_at = obj
        .creation_timestamp()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0);

    let (log_urls, json_path): (Vec<(String, String)>, String) = if gvk.kind == "Pod" {
        match &state.log_url_builder {
            Some(builder) => (builder.build(obj), builder.json_path().to_string()),
            None => (Vec::new(), String::new()),
        }
    } else {
        (Vec::new(), String::new())
    };

    let input = WriteInput {
        uid,
        api_version: &gvk.api_version,
        kind: &gvk.kind,
        namespace,
        name,
        resource_version,
        cluster_updated_ts: cluster_updated_ts(obj) + ts_bump,
        cluster_deleted_ts,
        created_at,
        data: &obj.raw,
        log_urls: &log_urls,
        json_path: &json_path,
    };

    state.writer.write(input).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_resource_version(rv: &str) -> KubeResource {
        KubeResource::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "uid": "1",
                "name": "a",
                "namespace": "default",
                "resourceVersion": rv,
            },
        }))
        .unwrap()
    }

    #[test]
    fn cluster_updated_ts_parses_resource_version() {
        let obj = pod_with_resource_version("42");
        assert_eq!(cluster_updated_ts(&obj), 42);
    }

    #[test]
    fn cluster_updated_ts_falls_back_to_wall_clock_when_unparseable() {
        let obj = pod_with_resource_version("not-a-number");
        // Non-numeric resourceVersion (shouldn't happen against a real API
        // server, but the parse is fallible) falls back to wall-clock rather
        // than panicking or silently using 0.
        assert!(cluster_updated_ts(&obj) > 0);
    }

    #[test]
    fn ts_bump_guarantees_strictly_greater_timestamp_for_the_same_object() {
        // The post-delete write reuses the same object (and hence the same
        // resourceVersion-derived base) as the write that preceded it; the
        // bump must make the second value strictly greater so the writer's
        // staleness guard doesn't reject it as a no-op.
        let obj = pod_with_resource_version("100");
        let first = cluster_updated_ts(&obj) + 0;
        let second = cluster_updated_ts(&obj) + 1;
        assert!(second > first);
    }
}

fn respond(status: StatusCode, event_type: &str, resource_type: &str, result: EventResult) -> Response {
    metrics::counter!(
        "kubearchive_events_total",
        "event_type" => event_type.to_string(),
        "resource_type" => resource_type.to_string(),
        "result" => result.as_str(),
    )
    .increment(1);

    (status, Json(serde_json::json!({ "result": result.as_str() }))).into_response()
}
