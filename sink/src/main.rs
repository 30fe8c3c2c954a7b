use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use kube::Client;

mod args;
mod cloudevent;
mod handler;
mod health;

use args::SinkArgs;
use handler::AppState;
use health::HealthState;
use kubearchive_common::args::DatabaseKind;
use kubearchive_deleter::ClusterDeleter;
use kubearchive_logurl::LogUrlBuilder;
use kubearchive_policy::PolicyStore;
use kubearchive_writer::ResourceWriter;
use kubearchive_writer::dialect::{MariadbWriter, PostgresWriter};

#[tokio::main]
async fn main() -> Result<()> {
    kubearchive_common::init();

    let args = SinkArgs::parse();

    kubearchive_common::metrics::maybe_spawn_metrics_server(args.otel_mode, args.metrics_port);

    let writer: Arc<dyn ResourceWriter> = match args.database.database_kind {
        DatabaseKind::Postgresql => {
            let pool = kubearchive_common::postgres::create_pool(args.database.postgres.clone()).await;
            let writer = PostgresWriter::new(pool);
            writer
                .init_schema()
                .await
                .context("failed to initialize postgresql schema")?;
            Arc::new(writer)
        }
        DatabaseKind::Mariadb => {
            let pool = kubearchive_common::mariadb::create_pool(args.database.mariadb.clone())
                .await
                .context("failed to connect to mariadb")?;
            let writer = MariadbWriter::new(pool);
            writer
                .init_schema()
                .await
                .context("failed to initialize mariadb schema")?;
            Arc::new(writer)
        }
    };

    let kube_client = Client::try_default()
        .await
        .context("failed to build kubernetes client")?;

    let policy_store = Arc::new(PolicyStore::new());
    match kubearchive_policy::fetch_configmap_once(&kube_client, &args.namespace, &args.policy_configmap).await {
        Ok(cm) => {
            let data = cm.data.unwrap_or_default();
            policy_store.swap(kubearchive_policy::build_snapshot(&data));
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "policy configmap not found at startup, starting with an empty policy table"
            );
        }
    }

    tokio::spawn(kubearchive_policy::watch_policy_configmap(
        policy_store.clone(),
        kube_client.clone(),
        args.namespace.clone(),
        args.policy_configmap.clone(),
    ));

    let log_url_builder = match &args.logging_dir {
        Some(dir) => match LogUrlBuilder::from_dir(dir) {
            Ok(builder) => Some(Arc::new(builder)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "log-url configuration invalid, sink will run without log-url emission"
                );
                None
            }
        },
        None => None,
    };

    let deleter = Arc::new(ClusterDeleter::new(kube_client.clone()));

    let app_state = AppState {
        writer: writer.clone(),
        policy: policy_store,
        log_url_builder,
        deleter,
    };

    let health_state = HealthState {
        writer,
        kube_client,
        policy_namespace: args.namespace,
        policy_configmap: args.policy_configmap,
    };

    let app = Router::new()
        .route("/", post(handler::ingest))
        .with_state(app_state)
        .merge(
            Router::new()
                .route("/livez", get(health::livez))
                .route("/readyz", get(health::readyz))
                .with_state(health_state),
        )
        .layer(kubearchive_common::metrics::MetricsLayer::new());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "starting kubearchive sink");
    kubearchive_common::signal_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(kubearchive_common::shutdown::shutdown_signal())
        .await?;

    tracing::info!("sink stopped gracefully");
    Ok(())
}
