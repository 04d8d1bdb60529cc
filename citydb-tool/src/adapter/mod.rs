//! Accès PostgreSQL/PostGIS (pool, adaptateur du moteur, schéma)

pub mod pool;
pub mod postgres;
pub mod schema;

pub use pool::{create_pool, test_connection, DatabaseConfig, SslMode};
pub use postgres::{PgConnection, PostgresAdapter};
