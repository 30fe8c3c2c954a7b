use clap::{Parser, ValueEnum};

/// Database backend selector, `DATABASE_KIND` in the environment table.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgresql,
    Mariadb,
}

/// `KUBEARCHIVE_OTEL_MODE`: whether this process installs its own metrics
/// recorder, defers to one installed by something else in the pod, or skips
/// metrics entirely.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[value(rename_all = "lowercase")]
pub enum OtelMode {
    Disabled,
    #[default]
    Enabled,
    Delegated,
}

#[derive(Parser, Debug, Clone)]
pub struct DatabaseArgs {
    #[arg(long, env = "DATABASE_KIND", value_enum, default_value = "postgresql")]
    pub database_kind: DatabaseKind,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub mariadb: MariadbArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "DATABASE_URL", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "DATABASE_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "DATABASE_DB", default_value = "kubearchive")]
    pub postgres_database: String,

    #[arg(long, env = "DATABASE_USER", default_value = "kubearchive")]
    pub postgres_username: String,

    #[arg(long, env = "DATABASE_PASSWORD")]
    pub postgres_password: Option<String>,

    #[arg(long, env = "DATABASE_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct MariadbArgs {
    #[arg(long, env = "DATABASE_URL", default_value = "localhost")]
    pub mariadb_host: String,

    #[arg(long, env = "DATABASE_PORT", default_value_t = 3306)]
    pub mariadb_port: u16,

    #[arg(long, env = "DATABASE_DB", default_value = "kubearchive")]
    pub mariadb_database: String,

    #[arg(long, env = "DATABASE_USER", default_value = "kubearchive")]
    pub mariadb_username: String,

    #[arg(long, env = "DATABASE_PASSWORD")]
    pub mariadb_password: Option<String>,
}
