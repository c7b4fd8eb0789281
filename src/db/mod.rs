use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::{Connection, rusqlite};

pub mod failovers;
pub mod restores;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open state database {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// In-memory database with the schema applied.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}
