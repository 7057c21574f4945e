//! Table definitions, versioned through `PRAGMA user_version`.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS users (
        id          TEXT PRIMARY KEY NOT NULL,
        name        TEXT NOT NULL,
        role        TEXT NOT NULL,
        admin_id    TEXT,
        token       TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS phone_numbers (
        id            TEXT PRIMARY KEY NOT NULL,
        admin_id      TEXT NOT NULL REFERENCES users(id),
        phone_number  TEXT NOT NULL UNIQUE,
        assigned_to   TEXT REFERENCES users(id),
        active        INTEGER NOT NULL DEFAULT 1,
        purchased_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_phone_numbers_admin ON phone_numbers(admin_id);
    CREATE INDEX IF NOT EXISTS idx_phone_numbers_assigned ON phone_numbers(assigned_to);

    CREATE TABLE IF NOT EXISTS contacts (
        id                 TEXT PRIMARY KEY NOT NULL,
        phone_number_id    TEXT NOT NULL REFERENCES phone_numbers(id),
        phone_number       TEXT NOT NULL,
        name               TEXT,
        last_message       TEXT,
        last_message_time  TEXT,
        unread_count       INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
        is_pinned          INTEGER NOT NULL DEFAULT 0,
        category           TEXT NOT NULL DEFAULT 'general',
        UNIQUE (phone_number_id, phone_number)
    );

    CREATE TABLE IF NOT EXISTS messages (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT NOT NULL UNIQUE,
        phone_number_id  TEXT NOT NULL REFERENCES phone_numbers(id),
        from_number      TEXT NOT NULL,
        to_number        TEXT NOT NULL,
        body             TEXT NOT NULL,
        direction        TEXT NOT NULL,
        timestamp        TEXT NOT NULL,
        sid              TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_phone_ts ON messages(phone_number_id, timestamp, seq);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_sid
        ON messages(phone_number_id, sid) WHERE sid IS NOT NULL;
"#];

/// Apply any migrations newer than the database's recorded version.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i32 + 1;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", version)?;
        tracing::debug!(version, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
