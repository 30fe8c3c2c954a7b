use crate::args::MariadbArgs;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;
use std::env;

pub async fn create_pool(args: MariadbArgs) -> Result<MySqlPool, sqlx::Error> {
    let password = args
        .mariadb_password
        .or_else(|| env::var("DATABASE_PASSWORD").ok())
        .unwrap_or_default();

    let options = MySqlConnectOptions::new()
        .host(&args.mariadb_host)
        .port(args.mariadb_port)
        .database(&args.mariadb_database)
        .username(&args.mariadb_username)
        .password(&password);

    MySqlPoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
}
