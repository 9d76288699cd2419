// Database module

pub mod migrations;

use rusqlite::Connection;
use std::path::Path;

use crate::error::Result;

/// Open or create the queue database at the given path.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Writers briefly block each other; wait instead of failing
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// In-memory database with the full schema, for tests.
pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}
