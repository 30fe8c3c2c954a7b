use clap::Parser;
use kubearchive_common::args::{DatabaseArgs, OtelMode};

#[derive(Parser, Debug, Clone)]
#[command(name = "kubearchive-sink")]
#[command(about = "Ingests Kubernetes resource-lifecycle CloudEvents and archives them")]
pub struct SinkArgs {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    #[arg(long, env = "KUBEARCHIVE_OTEL_MODE", value_enum, default_value = "enabled")]
    pub otel_mode: OtelMode,

    /// Namespace the policy ConfigMap lives in.
    #[arg(long, env = "KUBEARCHIVE_NAMESPACE", default_value = "kubearchive")]
    pub namespace: String,

    /// Name of the policy ConfigMap within that namespace.
    #[arg(long, env = "KUBEARCHIVE_POLICY_CONFIGMAP", default_value = "kubearchive-sink-policy")]
    pub policy_configmap: String,

    /// Directory of log-URL template variables. If unset, the sink runs
    /// without log-URL emission.
    #[arg(long, env = "KUBEARCHIVE_LOGGING_DIR")]
    pub logging_dir: Option<String>,

    #[clap(flatten)]
    pub database: DatabaseArgs,
}
