//! Riffs table
//!
//! Rows move through two states: a skeleton (id + owning jam only, null
//! CreationTime) inserted during a jam snapshot, later promoted to fully
//! populated by a riff-detail fetch. `CreationTime IS [NOT] NULL` is the
//! authoritative populated test everywhere.

use rusqlite::{params, Connection, OptionalExtension, Row};

use weft_core::model::{JamId, RiffId, RiffRecord, StemId};
use weft_core::types::STEM_SLOTS;

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "Riffs" (
            "RiffCID"       TEXT NOT NULL UNIQUE,
            "OwnerJamCID"   TEXT NOT NULL,
            "CreationTime"  INTEGER,
            "Root"          INTEGER,
            "Scale"         INTEGER,
            "BPS"           REAL,
            "BPMrnd"        REAL,
            "BarLength"     INTEGER,
            "AppVersion"    INTEGER,
            "Magnitude"     REAL,
            "UserName"      TEXT,
            "StemCID_1"     TEXT,
            "StemCID_2"     TEXT,
            "StemCID_3"     TEXT,
            "StemCID_4"     TEXT,
            "StemCID_5"     TEXT,
            "StemCID_6"     TEXT,
            "StemCID_7"     TEXT,
            "StemCID_8"     TEXT,
            "GainsJSON"     TEXT,
            PRIMARY KEY("RiffCID")
        );
        CREATE UNIQUE INDEX IF NOT EXISTS "Riff_IndexRiff"       ON "Riffs" ( "RiffCID" );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexOwner"      ON "Riffs" ( "OwnerJamCID" );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexTime"       ON "Riffs" ( "CreationTime" DESC );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexUser"       ON "Riffs" ( "UserName" );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexBPM"        ON "Riffs" ( "BPMrnd" );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexStems"      ON "Riffs" ( "StemCID_1", "StemCID_2", "StemCID_3", "StemCID_4", "StemCID_5", "StemCID_6", "StemCID_7", "StemCID_8" );
        CREATE INDEX        IF NOT EXISTS "Riff_IndexOwner2Time" ON "Riffs" ( "OwnerJamCID", "CreationTime" );
        "#,
    )
}

pub fn insert_skeleton(conn: &Connection, riff: &RiffId, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO Riffs( RiffCID, OwnerJamCID ) VALUES( ?1, ?2 )",
        params![riff.as_str(), jam.as_str()],
    )?;
    Ok(())
}

/// Promote a skeleton row to fully populated.
pub fn update_populated(conn: &Connection, record: &RiffRecord) -> rusqlite::Result<()> {
    let gains_json = serde_json::to_string(&record.gains)
        .unwrap_or_else(|_| "[0, 0, 0, 0, 0, 0, 0, 0]".to_owned());

    conn.execute(
        r#"UPDATE Riffs SET CreationTime=?2,
                            Root=?3,
                            Scale=?4,
                            BPS=?5,
                            BPMrnd=?6,
                            BarLength=?7,
                            AppVersion=?8,
                            Magnitude=?9,
                            UserName=?10,
                            StemCID_1=?11,
                            StemCID_2=?12,
                            StemCID_3=?13,
                            StemCID_4=?14,
                            StemCID_5=?15,
                            StemCID_6=?16,
                            StemCID_7=?17,
                            StemCID_8=?18,
                            GainsJSON=?19
                            WHERE RiffCID=?1"#,
        params![
            record.id.as_str(),
            record.creation_time,
            record.root,
            record.scale,
            record.bps,
            record.bpm_rnd,
            record.bar_length,
            record.app_version,
            record.magnitude,
            record.user,
            record.stems[0].as_str(),
            record.stems[1].as_str(),
            record.stems[2].as_str(),
            record.stems[3].as_str(),
            record.stems[4].as_str(),
            record.stems[5].as_str(),
            record.stems[6].as_str(),
            record.stems[7].as_str(),
            gains_json,
        ],
    )?;
    Ok(())
}

pub fn count_in_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT count(*) FROM Riffs WHERE OwnerJamCID IS ?1",
        params![jam.as_str()],
        |row| row.get(0),
    )
}

pub fn count_populated(conn: &Connection, jam: &JamId, populated: bool) -> rusqlite::Result<i64> {
    let sql = if populated {
        "SELECT count(*) FROM Riffs WHERE OwnerJamCID IS ?1 AND CreationTime IS NOT NULL"
    } else {
        "SELECT count(*) FROM Riffs WHERE OwnerJamCID IS ?1 AND CreationTime IS NULL"
    };
    conn.query_row(sql, params![jam.as_str()], |row| row.get(0))
}

/// Any single skeleton riff, anywhere; the worker uses this to pick which
/// jam to batch up next.
pub fn find_unpopulated(conn: &Connection) -> rusqlite::Result<Option<(JamId, RiffId)>> {
    conn.query_row(
        "SELECT OwnerJamCID, RiffCID FROM Riffs WHERE CreationTime IS NULL LIMIT 1",
        [],
        |row| {
            Ok((
                JamId::new(row.get::<_, String>(0)?),
                RiffId::new(row.get::<_, String>(1)?),
            ))
        },
    )
    .optional()
}

pub fn find_unpopulated_batch(
    conn: &Connection,
    jam: &JamId,
    limit: i64,
) -> rusqlite::Result<Vec<RiffId>> {
    let mut statement = conn.prepare(
        "SELECT RiffCID FROM Riffs WHERE OwnerJamCID IS ?1 AND CreationTime IS NULL LIMIT ?2",
    )?;
    let rows = statement.query_map(params![jam.as_str(), limit], |row| {
        Ok(RiffId::new(row.get::<_, String>(0)?))
    })?;
    rows.collect()
}

pub fn distinct_jam_ids(conn: &Connection) -> rusqlite::Result<Vec<JamId>> {
    let mut statement = conn.prepare("SELECT DISTINCT OwnerJamCID FROM Riffs")?;
    let rows = statement.query_map([], |row| Ok(JamId::new(row.get::<_, String>(0)?)))?;
    rows.collect()
}

/// All riff ids in a jam in creation order; skeletons sort first on null.
pub fn all_ids_by_time(conn: &Connection, jam: &JamId) -> rusqlite::Result<Vec<RiffId>> {
    let mut statement = conn.prepare(
        "SELECT RiffCID FROM Riffs WHERE OwnerJamCID = ?1 ORDER BY CreationTime ASC",
    )?;
    let rows = statement.query_map(params![jam.as_str()], |row| {
        Ok(RiffId::new(row.get::<_, String>(0)?))
    })?;
    rows.collect()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RiffRecord> {
    let mut record = RiffRecord {
        id: RiffId::new(row.get::<_, String>(0)?),
        jam_id: JamId::new(row.get::<_, String>(1)?),
        creation_time: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        root: row.get::<_, Option<u32>>(3)?.unwrap_or(0),
        scale: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
        bps: row.get::<_, Option<f32>>(5)?.unwrap_or(0.0),
        bpm_rnd: row.get::<_, Option<f32>>(6)?.unwrap_or(0.0),
        bar_length: row.get::<_, Option<i32>>(7)?.unwrap_or(0),
        app_version: row.get::<_, Option<i32>>(8)?.unwrap_or(0),
        magnitude: row.get::<_, Option<f32>>(9)?.unwrap_or(0.0),
        user: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        ..RiffRecord::default()
    };

    for slot in 0..STEM_SLOTS {
        record.stems[slot] =
            StemId::new(row.get::<_, Option<String>>(11 + slot)?.unwrap_or_default());
    }

    if let Some(gains_json) = row.get::<_, Option<String>>(19)? {
        match serde_json::from_str::<Vec<f32>>(&gains_json) {
            Ok(gains) => {
                for (slot, gain) in gains.into_iter().take(STEM_SLOTS).enumerate() {
                    record.gains[slot] = gain;
                }
            }
            Err(err) => log::error!("gains json parse failed for [{}]: {err}", record.id),
        }
    }

    record.sync_active_flags();
    Ok(record)
}

const SELECT_COLUMNS: &str = r#"RiffCID, OwnerJamCID, CreationTime, Root, Scale, BPS, BPMrnd,
    BarLength, AppVersion, Magnitude, UserName,
    StemCID_1, StemCID_2, StemCID_3, StemCID_4, StemCID_5, StemCID_6, StemCID_7, StemCID_8,
    GainsJSON"#;

pub fn get_single(conn: &Connection, riff: &RiffId) -> rusqlite::Result<Option<RiffRecord>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM Riffs WHERE RiffCID IS ?1"),
        params![riff.as_str()],
        record_from_row,
    )
    .optional()
}

/// Swap one stem slot on a riff row; also seeds a skeleton row for the new
/// stem so the scraper will fill it in. Data-repair support.
pub fn patch_stem_slot(
    conn: &Connection,
    jam: &JamId,
    riff: &RiffId,
    slot: usize,
    new_stem: &StemId,
) -> rusqlite::Result<bool> {
    let column = match slot {
        0 => "StemCID_1",
        1 => "StemCID_2",
        2 => "StemCID_3",
        3 => "StemCID_4",
        4 => "StemCID_5",
        5 => "StemCID_6",
        6 => "StemCID_7",
        7 => "StemCID_8",
        _ => {
            log::error!("patch_stem_slot index {slot} is invalid");
            return Ok(false);
        }
    };

    conn.execute(
        &format!("UPDATE Riffs SET {column}=?2 WHERE RiffCID=?1"),
        params![riff.as_str(), new_stem.as_str()],
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO Stems( StemCID, OwnerJamCID ) VALUES( ?1, ?2 )",
        params![new_stem.as_str(), jam.as_str()],
    )?;
    Ok(true)
}

pub fn delete_all_for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM Riffs WHERE OwnerJamCID = ?1", params![jam.as_str()])?;
    Ok(())
}

/// Remove only skeleton rows, leaving populated data alone.
pub fn delete_unpopulated_for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM Riffs WHERE OwnerJamCID = ?1 AND CreationTime IS NULL",
        params![jam.as_str()],
    )?;
    Ok(())
}
