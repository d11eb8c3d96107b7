use rusqlite::Connection;

use crate::error::Result;

/// Initialise the alarm schema in `conn`.
///
/// The `alarm` table holds at most one row (`id = 1`); the definition is
/// stored as JSON so new optional fields never need a migration.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alarm (
            id          INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
            definition  TEXT    NOT NULL,   -- JSON-encoded AlarmDefinition
            revision    INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
