//! Database migrations.
//!
//! SQLx embedded migrations for the SQLite record store.

use sqlx::SqlitePool;

static SQLITE_MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/sqlite");

pub async fn run_sqlite(pool: &SqlitePool) -> crate::infra::Result<()> {
    SQLITE_MIGRATOR.run(pool).await?;
    Ok(())
}
