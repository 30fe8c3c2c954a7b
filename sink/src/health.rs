use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};

use kubearchive_writer::ResourceWriter;

#[derive(Clone)]
pub struct HealthState {
    pub writer: Arc<dyn ResourceWriter>,
    pub kube_client: Client,
    pub policy_namespace: String,
    pub policy_configmap: String,
}

pub async fn livez() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

pub async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    if let Err(e) = state.writer.ping().await {
        tracing::warn!(error = %e, "readyz: database ping failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "database unreachable" })),
        );
    }

    let api: Api<ConfigMap> = Api::namespaced(state.kube_client.clone(), &state.policy_namespace);
    if let Err(e) = api.get(&state.policy_configmap).await {
        tracing::warn!(error = %e, "readyz: policy configmap unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "policy configmap unreachable" })),
        );
    }

    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
