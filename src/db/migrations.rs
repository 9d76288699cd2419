// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpindleError};

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Work items (durable queue)
    CREATE TABLE items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_kind TEXT NOT NULL CHECK (source_kind IN ('disc', 'file')),
        source_path TEXT,
        disc_label TEXT,
        disc_fingerprint TEXT,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'identifying', 'identified', 'ripping', 'ripped',
                              'episode-identifying', 'episode-identified', 'encoding', 'encoded',
                              'subtitling', 'subtitled', 'organizing', 'completed', 'review', 'failed')),
        claimed_from TEXT,
        progress_stage TEXT,
        progress_percent REAL NOT NULL DEFAULT 0,
        progress_message TEXT,
        last_heartbeat TEXT,
        metadata TEXT,
        rip_spec TEXT,
        ripped_path TEXT,
        encoded_path TEXT,
        final_path TEXT,
        error_message TEXT,
        needs_review INTEGER NOT NULL DEFAULT 0,
        review_reason TEXT,
        stop_requested INTEGER NOT NULL DEFAULT 0,
        run_token TEXT,
        claimed_by TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Episode sub-records
    CREATE TABLE episodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        season INTEGER NOT NULL,
        episode INTEGER NOT NULL,
        title TEXT,
        stage TEXT NOT NULL DEFAULT 'planned'
            CHECK (stage IN ('planned', 'ripped', 'encoded', 'final', 'failed')),
        runtime_seconds INTEGER,
        ripped_path TEXT,
        encoded_path TEXT,
        final_path TEXT,
        subtitle_source TEXT,
        subtitle_language TEXT,
        subtitle_match_score REAL,
        progress_percent REAL NOT NULL DEFAULT 0,
        progress_message TEXT,
        UNIQUE(item_id, key)
    );

    -- Indexes for common queries
    CREATE INDEX idx_items_status ON items(status);
    CREATE INDEX idx_items_fingerprint ON items(disc_fingerprint);
    CREATE INDEX idx_items_created ON items(created_at, id);
    CREATE INDEX idx_episodes_item ON episodes(item_id);
    "#,
];

/// Tables and the columns a health check expects to find.
const EXPECTED_TABLES: &[(&str, &[&str])] = &[
    (
        "items",
        &[
            "id",
            "source_kind",
            "status",
            "claimed_from",
            "progress_stage",
            "progress_percent",
            "last_heartbeat",
            "metadata",
            "rip_spec",
            "ripped_path",
            "encoded_path",
            "final_path",
            "error_message",
            "needs_review",
            "review_reason",
            "stop_requested",
            "run_token",
            "claimed_by",
            "created_at",
            "updated_at",
        ],
    ),
    (
        "episodes",
        &[
            "id", "item_id", "key", "season", "episode", "title", "stage", "runtime_seconds",
        ],
    ),
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

pub fn supported_schema_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = supported_schema_version();

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        return Err(SpindleError::SchemaMismatch {
            found: current_version,
            supported: target_version,
        });
    }

    if current_version == target_version {
        return Ok(());
    }

    // Apply pending migrations one-by-one
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied database migration {}", migration_version);
    }

    Ok(())
}

/// Schema and integrity report for the `database.health` IPC method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub schema_version: u32,
    pub supported_version: u32,
    pub missing_tables: Vec<String>,
    pub missing_columns: Vec<String>,
    pub integrity: String,
    pub item_count: i64,
}

impl DatabaseHealth {
    pub fn is_ok(&self) -> bool {
        self.schema_version == self.supported_version
            && self.missing_tables.is_empty()
            && self.missing_columns.is_empty()
            && self.integrity == "ok"
    }
}

/// Inspect the schema without mutating it.
pub fn health_report(conn: &Connection) -> Result<DatabaseHealth> {
    let schema_version = get_schema_version(conn)?;

    let mut missing_tables = Vec::new();
    let mut missing_columns = Vec::new();

    for (table, columns) in EXPECTED_TABLES {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )?;
        if !exists {
            missing_tables.push(table.to_string());
            continue;
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let present: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        for column in *columns {
            if !present.iter().any(|c| c == column) {
                missing_columns.push(format!("{}.{}", table, column));
            }
        }
    }

    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;

    let item_count: i64 = if missing_tables.iter().any(|t| t == "items") {
        0
    } else {
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?
    };

    Ok(DatabaseHealth {
        schema_version,
        supported_version: supported_schema_version(),
        missing_tables,
        missing_columns,
        integrity,
        item_count,
    })
}
