//! Stems table; same skeleton/populated lifecycle as riffs.

use rusqlite::{params, Connection, OptionalExtension, Row};

use weft_core::model::{InstrumentFlags, JamId, StemId, StemRecord};

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "Stems" (
            "StemCID"           TEXT NOT NULL UNIQUE,
            "OwnerJamCID"       TEXT NOT NULL,
            "CreationTime"      INTEGER,
            "FileEndpoint"      TEXT,
            "FileBucket"        TEXT,
            "FileKey"           TEXT,
            "FileMIME"          TEXT,
            "FileLength"        INTEGER,
            "BPS"               REAL,
            "BPMrnd"            REAL,
            "Instrument"        INTEGER,
            "Length16s"         REAL,
            "OriginalPitch"     REAL,
            "BarLength"         REAL,
            "PresetName"        TEXT,
            "CreatorUserName"   TEXT,
            "SampleRate"        INTEGER,
            "PrimaryColour"     TEXT,
            PRIMARY KEY("StemCID")
        );
        CREATE UNIQUE INDEX IF NOT EXISTS "Stems_IndexStem"       ON "Stems" ( "StemCID" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexPreset"     ON "Stems" ( "PresetName" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexTime"       ON "Stems" ( "CreationTime" DESC );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexUser"       ON "Stems" ( "CreatorUserName" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexBPM"        ON "Stems" ( "BPMrnd" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexOwner"      ON "Stems" ( "OwnerJamCID" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexOwner2Time" ON "Stems" ( "OwnerJamCID", "CreationTime" );
        CREATE INDEX        IF NOT EXISTS "Stems_IndexOwnerSlice" ON "Stems" ( "OwnerJamCID", "CreationTime" IS NOT NULL );
        "#,
    )
}

pub fn insert_skeleton(conn: &Connection, stem: &StemId, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO Stems( StemCID, OwnerJamCID ) VALUES( ?1, ?2 )",
        params![stem.as_str(), jam.as_str()],
    )?;
    Ok(())
}

pub fn update_populated(conn: &Connection, record: &StemRecord) -> rusqlite::Result<()> {
    conn.execute(
        r#"UPDATE Stems SET CreationTime=?2,
                            FileEndpoint=?3,
                            FileBucket=?4,
                            FileKey=?5,
                            FileMIME=?6,
                            FileLength=?7,
                            BPS=?8,
                            BPMrnd=?9,
                            Instrument=?10,
                            Length16s=?11,
                            OriginalPitch=?12,
                            BarLength=?13,
                            PresetName=?14,
                            CreatorUserName=?15,
                            SampleRate=?16,
                            PrimaryColour=?17
                            WHERE StemCID=?1"#,
        params![
            record.id.as_str(),
            record.creation_time,
            record.file_endpoint,
            record.file_bucket,
            record.file_key,
            record.file_mime,
            record.file_length_bytes as i64,
            record.bps,
            record.bpm_rnd,
            record.instrument.to_mask(),
            record.length_16ths,
            record.original_pitch,
            record.bar_length,
            record.preset,
            record.user,
            record.sample_rate,
            record.colour,
        ],
    )?;
    Ok(())
}

pub fn count_populated(conn: &Connection, jam: &JamId, populated: bool) -> rusqlite::Result<i64> {
    let sql = if populated {
        "SELECT count(*) FROM Stems WHERE OwnerJamCID IS ?1 AND CreationTime IS NOT NULL"
    } else {
        "SELECT count(*) FROM Stems WHERE OwnerJamCID IS ?1 AND CreationTime IS NULL"
    };
    conn.query_row(sql, params![jam.as_str()], |row| row.get(0))
}

pub fn find_unpopulated(conn: &Connection) -> rusqlite::Result<Option<(JamId, StemId)>> {
    conn.query_row(
        "SELECT OwnerJamCID, StemCID FROM Stems WHERE CreationTime IS NULL LIMIT 1",
        [],
        |row| {
            Ok((
                JamId::new(row.get::<_, String>(0)?),
                StemId::new(row.get::<_, String>(1)?),
            ))
        },
    )
    .optional()
}

pub fn find_unpopulated_batch(
    conn: &Connection,
    jam: &JamId,
    limit: i64,
) -> rusqlite::Result<Vec<StemId>> {
    let mut statement = conn.prepare(
        "SELECT StemCID FROM Stems WHERE OwnerJamCID IS ?1 AND CreationTime IS NULL LIMIT ?2",
    )?;
    let rows = statement.query_map(params![jam.as_str(), limit], |row| {
        Ok(StemId::new(row.get::<_, String>(0)?))
    })?;
    rows.collect()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StemRecord> {
    Ok(StemRecord {
        id: StemId::new(row.get::<_, String>(0)?),
        jam_id: JamId::new(row.get::<_, String>(1)?),
        creation_time: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        file_endpoint: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        file_bucket: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        file_key: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        file_mime: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        file_length_bytes: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u64,
        bps: row.get::<_, Option<f32>>(8)?.unwrap_or(0.0),
        bpm_rnd: row.get::<_, Option<f32>>(9)?.unwrap_or(0.0),
        instrument: InstrumentFlags::from_mask(row.get::<_, Option<i32>>(10)?.unwrap_or(0)),
        length_16ths: row.get::<_, Option<f32>>(11)?.unwrap_or(0.0),
        original_pitch: row.get::<_, Option<f32>>(12)?.unwrap_or(0.0),
        bar_length: row.get::<_, Option<f32>>(13)?.unwrap_or(0.0),
        preset: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        user: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
        sample_rate: row.get::<_, Option<u32>>(16)?.unwrap_or(0),
        colour: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
    })
}

const SELECT_COLUMNS: &str = r#"StemCID, OwnerJamCID, CreationTime, FileEndpoint, FileBucket,
    FileKey, FileMIME, FileLength, BPS, BPMrnd, Instrument, Length16s, OriginalPitch,
    BarLength, PresetName, CreatorUserName, SampleRate, PrimaryColour"#;

pub fn get_single(conn: &Connection, stem: &StemId) -> rusqlite::Result<Option<StemRecord>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM Stems WHERE StemCID IS ?1"),
        params![stem.as_str()],
        record_from_row,
    )
    .optional()
}

/// All stem ids in a jam, oldest first.
pub fn all_ids_for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<Vec<StemId>> {
    let mut statement = conn.prepare(
        "SELECT StemCID FROM Stems WHERE OwnerJamCID = ?1 ORDER BY CreationTime ASC",
    )?;
    let rows = statement.query_map(params![jam.as_str()], |row| {
        Ok(StemId::new(row.get::<_, String>(0)?))
    })?;
    rows.collect()
}

/// Every stem id in the database. Can be very large on a well-fed warehouse;
/// not for casual use.
pub fn all_ids(conn: &Connection) -> rusqlite::Result<Vec<StemId>> {
    let mut statement = conn.prepare("SELECT StemCID FROM Stems")?;
    let rows = statement.query_map([], |row| Ok(StemId::new(row.get::<_, String>(0)?)))?;
    rows.collect()
}

pub fn owner_jam(conn: &Connection, stem: &StemId) -> rusqlite::Result<Option<JamId>> {
    conn.query_row(
        "SELECT OwnerJamCID FROM Stems WHERE StemCID = ?1",
        params![stem.as_str()],
        |row| Ok(JamId::new(row.get::<_, String>(0)?)),
    )
    .optional()
}

pub fn delete_all_for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM Stems WHERE OwnerJamCID = ?1", params![jam.as_str()])?;
    Ok(())
}
