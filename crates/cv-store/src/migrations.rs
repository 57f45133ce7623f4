//! Forward-only, idempotent schema migrations, gated by `PRAGMA user_version`.
//!
//! Every table backing this store lives in one SQLite file regardless of
//! which crate owns writes to it (`cv-collab`'s attachments/scenarios,
//! `cv-bridge`'s pairs/tasks) — this module is the single place that
//! creates all of them, so two crates opening separate connections to the
//! same file never race on `user_version`.

use rusqlite::Connection;

use cv_domain::Result;

const CURRENT_VERSION: i64 = 2;

/// Applies every migration up to [`CURRENT_VERSION`] that hasn't run yet.
/// Each step is additive and uses `CREATE TABLE IF NOT EXISTS`, so calling
/// this twice against the same file (e.g. from two connections opened at
/// nearly the same time) is harmless.
pub fn run(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    conn.pragma_update(None, "user_version", CURRENT_VERSION)?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            status          TEXT NOT NULL,
            metadata_json   TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_events (
            conversation_id INTEGER NOT NULL,
            seq             INTEGER NOT NULL,
            turn            INTEGER NOT NULL,
            event           INTEGER NOT NULL,
            type            TEXT NOT NULL,
            payload_json    TEXT NOT NULL,
            finality        TEXT NOT NULL,
            agent_id        TEXT NOT NULL,
            ts              TEXT NOT NULL,
            PRIMARY KEY (conversation_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_conversation_events_type
            ON conversation_events (conversation_id, type, seq);

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            conversation_id    INTEGER NOT NULL,
            client_request_id  TEXT NOT NULL,
            seq                INTEGER NOT NULL,
            turn               INTEGER NOT NULL,
            event              INTEGER NOT NULL,
            created_at         TEXT NOT NULL,
            PRIMARY KEY (conversation_id, client_request_id)
        );
        CREATE INDEX IF NOT EXISTS idx_idempotency_keys_created_at
            ON idempotency_keys (created_at);

        CREATE TABLE IF NOT EXISTS runner_registry (
            conversation_id INTEGER NOT NULL,
            agent_id        TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (conversation_id, agent_id)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id              TEXT PRIMARY KEY,
            conversation_id INTEGER NOT NULL,
            doc_id          TEXT,
            name            TEXT NOT NULL,
            content_type    TEXT NOT NULL,
            content         BLOB NOT NULL,
            summary         TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_doc_id
            ON attachments (conversation_id, doc_id);

        CREATE TABLE IF NOT EXISTS scenarios (
            id           TEXT PRIMARY KEY,
            name         TEXT NOT NULL,
            config_json  TEXT NOT NULL,
            history_json TEXT NOT NULL DEFAULT '[]',
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pairs (
            pair_id       TEXT PRIMARY KEY,
            epoch         INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            pair_id TEXT NOT NULL,
            epoch   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_pair_epoch ON tasks (pair_id, epoch);
        "#,
    )?;
    Ok(())
}

/// Links each pair epoch to the orchestrator conversation backing it, so
/// the bridge can project `tasks/get` off the same event log the rest of
/// the core writes through instead of a second source of truth.
fn migrate_v2(conn: &Connection) -> Result<()> {
    let has_column: bool = conn
        .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'conversation_id'")?
        .exists([])?;
    if !has_column {
        conn.execute_batch(
            "ALTER TABLE tasks ADD COLUMN conversation_id INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    Ok(())
}

/// Opens a connection with the pragmas every `cv-*` store wants: WAL for
/// concurrent readers across the several connections this process opens
/// to the same file, foreign keys off (none declared — kept explicit),
/// and migrations applied.
pub fn open(path: &std::path::Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| {
                cv_domain::Error::Fatal(format!("creating store directory: {e}"))
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;
    run(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
