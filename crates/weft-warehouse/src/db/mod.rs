//! Warehouse storage
//!
//! SQLite behind an r2d2 pool: the worker thread owns all writes, read-only
//! queries may run from any thread on their own pooled connection. Schema
//! creation is idempotent; opening an existing database is a no-op beyond
//! the pragmas.

pub mod jams;
pub mod ledger;
pub mod riffs;
pub mod stems;
pub mod tags;

use std::path::Path;

use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open (or create) the warehouse database and prepare the schema.
pub fn open_pool(path: &Path) -> anyhow::Result<DbPool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA temp_store = memory;")?;
        Ok(())
    });

    let pool = r2d2::Pool::builder().max_size(4).build(manager)?;

    let conn = pool.get()?;
    init_schema(&conn)?;

    log::info!("warehouse database open at [{}]", path.display());
    Ok(pool)
}

/// Create all tables and indexes; safe to run on every open.
pub fn init_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    jams::init(conn)?;
    riffs::init(conn)?;
    tags::init(conn)?;
    stems::init(conn)?;
    ledger::init(conn)?;
    Ok(())
}

/// Give sqlite a chance to refresh its query-planner statistics; run once at
/// shutdown.
pub fn optimize(conn: &rusqlite::Connection) {
    if let Err(err) = conn.execute_batch("PRAGMA optimize;") {
        log::warn!("pragma optimize failed: {err}");
    }
}

#[cfg(test)]
pub(crate) fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(&dir.path().join("warehouse.db3")).unwrap();
    (dir, pool)
}
