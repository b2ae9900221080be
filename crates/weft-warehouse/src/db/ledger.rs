//! Stem ledger: a permanent note for every stem the scraper refused to
//! ingest, with the reason, so damaged upstream data never loops back into
//! the sync queue.

use rusqlite::{params, Connection, OptionalExtension};

use weft_core::model::StemId;

/// Why a stem was rejected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StemLedgerKind {
    /// Audio attachment vanished upstream
    MissingAudio = 1,
    /// The id resolved to some other document type entirely
    DamagedReference = 2,
    /// The id no longer resolves at all
    RemovedId = 3,
}

impl StemLedgerKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(StemLedgerKind::MissingAudio),
            2 => Some(StemLedgerKind::DamagedReference),
            3 => Some(StemLedgerKind::RemovedId),
            _ => None,
        }
    }
}

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "StemLedger" (
            "StemCID"       TEXT NOT NULL UNIQUE,
            "Type"          INTEGER,
            "Note"          TEXT NOT NULL,
            PRIMARY KEY("StemCID")
        );
        CREATE UNIQUE INDEX IF NOT EXISTS "Ledger_IndexStem" ON "StemLedger" ( "StemCID" );
        "#,
    )
}

pub fn store_note(
    conn: &Connection,
    stem: &StemId,
    kind: StemLedgerKind,
    note: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO StemLedger( StemCID, Type, Note ) VALUES( ?1, ?2, ?3 )",
        params![stem.as_str(), kind as i32, note],
    )?;
    Ok(())
}

pub fn get_for_stem(
    conn: &Connection,
    stem: &StemId,
) -> rusqlite::Result<Option<(StemLedgerKind, String)>> {
    conn.query_row(
        "SELECT Type, Note FROM StemLedger WHERE StemCID = ?1",
        params![stem.as_str()],
        |row| {
            let kind: i32 = row.get(0)?;
            Ok((kind, row.get::<_, String>(1)?))
        },
    )
    .optional()
    .map(|entry| {
        entry.and_then(|(kind, note)| StemLedgerKind::from_i32(kind).map(|k| (k, note)))
    })
}

pub fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT count(*) FROM StemLedger", [], |row| row.get(0))
}
