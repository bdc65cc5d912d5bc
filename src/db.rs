use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::result::QueryResult;
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{local_write, ReminderSyncError, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
pub type SqlitePool = Pool<SqliteAsyncConn>;
pub type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

const BUSY_TIMEOUT_PRAGMA: &str = "PRAGMA busy_timeout = 5000";

pub fn open_connection_sync(database_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
    conn.batch_execute(BUSY_TIMEOUT_PRAGMA)
        .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
    Ok(conn)
}

pub async fn apply_connection_pragmas_async(conn: &mut SqliteAsyncConn) -> Result<()> {
    diesel_async::RunQueryDsl::execute(diesel::sql_query(BUSY_TIMEOUT_PRAGMA), conn)
        .await
        .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
    Ok(())
}

/// Runs migrations, switches the file to WAL and returns a pool over it.
pub async fn open_pool(sqlite_path: &str) -> Result<SqlitePool> {
    ensure_parent_dir(sqlite_path)?;
    run_migrations(sqlite_path).await?;

    let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(sqlite_path);
    Pool::builder()
        .build(manager)
        .await
        .map_err(|e| ReminderSyncError::Runtime(e.to_string()))
}

pub async fn checkout(pool: &SqlitePool) -> Result<SqlitePooledConn<'_>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
    apply_connection_pragmas_async(&mut conn).await?;
    Ok(conn)
}

/// Runs `task` inside one `BEGIN IMMEDIATE` transaction on the connection's blocking thread.
pub async fn write_tx<R, F>(conn: &mut SqliteAsyncConn, task: F) -> Result<R>
where
    F: FnOnce(&mut SqliteConnection) -> QueryResult<R> + Send + 'static,
    R: Send + 'static,
{
    conn.spawn_blocking(move |conn| conn.immediate_transaction(task))
        .await
        .map_err(local_write)
}

pub fn ensure_parent_dir(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(parent).map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
    }
    Ok(())
}

async fn run_migrations(database_url: &str) -> Result<()> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = open_connection_sync(&database_url)?;
        conn.batch_execute("PRAGMA journal_mode = WAL")
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        Ok::<_, ReminderSyncError>(())
    })
    .await
    .map_err(|e| ReminderSyncError::Runtime(e.to_string()))??;
    Ok(())
}
