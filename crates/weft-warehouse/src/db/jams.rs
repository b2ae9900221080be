//! Jams table: jam id to public display name.

use rusqlite::{params, Connection, OptionalExtension};

use weft_core::model::JamId;

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "Jams" (
            "JamCID"        TEXT NOT NULL UNIQUE,
            "PublicName"    TEXT NOT NULL,
            PRIMARY KEY("JamCID")
        );
        CREATE UNIQUE INDEX IF NOT EXISTS "Jams_IndexJam" ON "Jams" ( "JamCID" );
        "#,
    )
}

pub fn upsert_name(conn: &Connection, jam: &JamId, public_name: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO Jams( JamCID, PublicName ) VALUES( ?1, ?2 )
           ON CONFLICT(JamCID) DO UPDATE SET PublicName = ?2"#,
        params![jam.as_str(), public_name],
    )?;
    Ok(())
}

pub fn public_name(conn: &Connection, jam: &JamId) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT PublicName FROM Jams WHERE JamCID IS ?1",
        params![jam.as_str()],
        |row| row.get(0),
    )
    .optional()
}

/// Full id -> name mapping, for UI dictionaries.
pub fn extract_dictionary(conn: &Connection) -> rusqlite::Result<Vec<(JamId, String)>> {
    let mut statement = conn.prepare("SELECT JamCID, PublicName FROM Jams")?;
    let rows = statement.query_map([], |row| {
        Ok((JamId::new(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
    })?;
    rows.collect()
}

pub fn delete(conn: &Connection, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM Jams WHERE JamCID = ?1", params![jam.as_str()])?;
    Ok(())
}
