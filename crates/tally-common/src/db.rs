//! Database pool construction.

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::error::{TallyError, TallyResult};

/// Build a PostgreSQL pool from configuration.
///
/// The per-statement timeout is applied on every new connection so
/// long-running statements cannot wedge a worker.
pub async fn connect_pool(config: &DatabaseConfig) -> TallyResult<PgPool> {
    let statement_timeout_ms = config.statement_timeout_secs * 1000;

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::Executor::execute(
                    conn,
                    format!("SET statement_timeout = {statement_timeout_ms}").as_str(),
                )
                .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await
        .map_err(|e| TallyError::Database(format!("database connect: {e}")))
}
