pub mod mariadb;
pub mod postgres;

pub use mariadb::MariadbWriter;
pub use postgres::PostgresWriter;
