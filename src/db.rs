use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use crate::schedule::Cadence;

pub const DB_FILE: &str = "cert.sqlite3";

/// Table and column names below are frozen platform contract; renaming any of
/// them breaks compatibility with existing workspaces and exports.
pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            avatar_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admin_users(
            user_id TEXT PRIMARY KEY,
            granted_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracks(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            cadence TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            term_number INTEGER NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_tracks(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            warning_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(track_id) REFERENCES tracks(id),
            UNIQUE(user_id, track_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_tracks_user ON user_tracks(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_tracks_track ON user_tracks(track_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            certification_date TEXT NOT NULL,
            url TEXT NOT NULL,
            notes TEXT,
            status TEXT NOT NULL,
            idempotency_key TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(track_id) REFERENCES tracks(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            UNIQUE(user_id, track_id, certification_date)
        )",
        [],
    )?;
    // Workspaces predating retry-safe submission lack the key column.
    ensure_certifications_idempotency_key(&conn)?;
    ensure_certifications_unique_per_date(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certifications_user_track
         ON certifications(user_id, track_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certifications_period ON certifications(period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certifications_date ON certifications(certification_date)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_certifications_idempotency
         ON certifications(idempotency_key) WHERE idempotency_key IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certifications_backup(
            id TEXT PRIMARY KEY,
            original_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            certification_date TEXT NOT NULL,
            url TEXT NOT NULL,
            notes TEXT,
            status TEXT NOT NULL,
            idempotency_key TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            deleted_by TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            delete_reason TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certifications_backup_user
         ON certifications_backup(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS page_contents(
            slug TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    seed_default_tracks(&conn)?;

    Ok(conn)
}

fn ensure_certifications_idempotency_key(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "certifications", "idempotency_key")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE certifications ADD COLUMN idempotency_key TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Upstream schemas carried UNIQUE(user_id, track_id, period_id): one slot per
/// period, silently overwritten by every daily submission. Rebuild such tables
/// onto the per-date constraint, keeping the newest row per (user, track, date).
fn ensure_certifications_unique_per_date(conn: &Connection) -> anyhow::Result<()> {
    let has_per_period_unique: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master
             WHERE type = 'table' AND name = 'certifications'
               AND sql LIKE '%UNIQUE(user_id, track_id, period_id)%'",
            [],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !has_per_period_unique {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "CREATE TABLE certifications_new(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            certification_date TEXT NOT NULL,
            url TEXT NOT NULL,
            notes TEXT,
            status TEXT NOT NULL,
            idempotency_key TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(track_id) REFERENCES tracks(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            UNIQUE(user_id, track_id, certification_date)
        )",
        [],
    )?;
    tx.execute(
        "INSERT INTO certifications_new
         SELECT id, user_id, track_id, period_id, certification_date, url,
                notes, status, idempotency_key, created_at, updated_at
         FROM certifications c
         WHERE rowid = (
            SELECT MAX(rowid) FROM certifications
            WHERE user_id = c.user_id
              AND track_id = c.track_id
              AND certification_date = c.certification_date
         )",
        [],
    )?;
    tx.execute("DROP TABLE certifications", [])?;
    tx.execute("ALTER TABLE certifications_new RENAME TO certifications", [])?;
    tx.commit()?;
    tracing::info!("rebuilt certifications table onto per-date unique constraint");
    Ok(())
}

/// The four launch tracks. Insert-if-absent so operator edits survive reopen.
fn seed_default_tracks(conn: &Connection) -> anyhow::Result<()> {
    let defaults = [
        ("기상 인증", Cadence::DailyWeekday),
        ("주간 회고", Cadence::WeeklySunday),
        ("러닝 인증", Cadence::WeeklySunday),
        ("알고리즘 스터디", Cadence::WeeklyTuesday),
    ];
    for (name, cadence) in defaults {
        conn.execute(
            "INSERT INTO tracks(id, name, cadence, active)
             VALUES(?, ?, ?, 1)
             ON CONFLICT(name) DO NOTHING",
            (Uuid::new_v4().to_string(), name, cadence.as_db()),
        )?;
    }
    Ok(())
}

/// Counterpart of the platform's is_admin(user_id) RPC.
pub fn is_admin(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM admin_users WHERE user_id = ?",
        [user_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}
