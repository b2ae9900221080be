//! Tags table: user annotations on riffs, ordered within their jam.

use rusqlite::{params, Connection, OptionalExtension, Row};

use weft_core::model::{JamId, RiffId, RiffTag};

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "Tags" (
            "RiffCID"       TEXT NOT NULL UNIQUE,
            "OwnerJamCID"   TEXT NOT NULL,
            "Ordering"      INTEGER,
            "Timestamp"     INTEGER,
            "Favour"        INTEGER,
            "Note"          TEXT,
            PRIMARY KEY("RiffCID")
        );
        CREATE UNIQUE INDEX IF NOT EXISTS "Tags_IndexRiff"      ON "Tags" ( "RiffCID" );
        CREATE INDEX        IF NOT EXISTS "Tags_IndexOwner"     ON "Tags" ( "OwnerJamCID" );
        CREATE INDEX        IF NOT EXISTS "Tags_IndexOrdering"  ON "Tags" ( "Ordering" );
        CREATE INDEX        IF NOT EXISTS "Tags_IndexTimestamp" ON "Tags" ( "Timestamp" );
        "#,
    )
}

/// Upsert without a transaction guard so batch operations can wrap their
/// own. A negative ordering asks for append: highest current ordering in the
/// jam plus one. Returns the tag with its resolved ordering.
pub fn upsert_unguarded(conn: &Connection, tag: &RiffTag) -> rusqlite::Result<RiffTag> {
    let mut resolved = tag.clone();

    if resolved.ordering < 0 {
        let highest: i32 = conn
            .query_row(
                "SELECT Ordering FROM Tags WHERE OwnerJamCID = ?1 ORDER BY Ordering DESC LIMIT 1",
                params![resolved.jam_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        resolved.ordering = highest + 1;
        log::debug!("tag upsert [{}] appended at ordering {}", resolved.riff_id, resolved.ordering);
    }

    conn.execute(
        r#"INSERT INTO Tags( OwnerJamCID, RiffCID, Ordering, Timestamp, Favour, Note )
           VALUES( ?1, ?2, ?3, ?4, ?5, ?6 )
           ON CONFLICT(RiffCID) DO UPDATE SET
               Ordering = ?3, Timestamp = ?4, Favour = ?5, Note = ?6"#,
        params![
            resolved.jam_id.as_str(),
            resolved.riff_id.as_str(),
            resolved.ordering,
            resolved.timestamp,
            resolved.favour,
            resolved.note,
        ],
    )?;

    Ok(resolved)
}

pub fn remove(conn: &Connection, riff: &RiffId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM Tags WHERE RiffCID = ?1", params![riff.as_str()])?;
    Ok(())
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<RiffTag> {
    Ok(RiffTag {
        jam_id: JamId::new(row.get::<_, String>(0)?),
        riff_id: RiffId::new(row.get::<_, String>(1)?),
        ordering: row.get(2)?,
        timestamp: row.get(3)?,
        favour: row.get(4)?,
        note: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
    })
}

pub fn get_for_riff(conn: &Connection, riff: &RiffId) -> rusqlite::Result<Option<RiffTag>> {
    conn.query_row(
        "SELECT OwnerJamCID, RiffCID, Ordering, Timestamp, Favour, Note FROM Tags WHERE RiffCID IS ?1",
        params![riff.as_str()],
        tag_from_row,
    )
    .optional()
}

pub fn for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<Vec<RiffTag>> {
    let mut statement = conn.prepare(
        "SELECT OwnerJamCID, RiffCID, Ordering, Timestamp, Favour, Note FROM Tags
         WHERE OwnerJamCID IS ?1 ORDER BY Ordering ASC",
    )?;
    let rows = statement.query_map(params![jam.as_str()], tag_from_row)?;
    rows.collect()
}

pub fn remove_all_for_jam(conn: &Connection, jam: &JamId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM Tags WHERE OwnerJamCID = ?1", params![jam.as_str()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn tag(jam: &str, riff: &str, ordering: i32) -> RiffTag {
        RiffTag {
            jam_id: JamId::from(jam),
            riff_id: RiffId::from(riff),
            ordering,
            timestamp: 1_650_000_000,
            favour: 1,
            note: "note".to_owned(),
        }
    }

    #[test]
    fn test_negative_ordering_appends() {
        let (_dir, pool) = db::test_pool();
        let conn = pool.get().unwrap();

        let first = upsert_unguarded(&conn, &tag("band_t", "r1", -1)).unwrap();
        let second = upsert_unguarded(&conn, &tag("band_t", "r2", -1)).unwrap();
        assert_eq!(first.ordering, 1);
        assert_eq!(second.ordering, 2);

        // explicit ordering is taken as-is
        let pinned = upsert_unguarded(&conn, &tag("band_t", "r3", 10)).unwrap();
        assert_eq!(pinned.ordering, 10);

        // append continues after the highest value in the jam
        let next = upsert_unguarded(&conn, &tag("band_t", "r4", -1)).unwrap();
        assert_eq!(next.ordering, 11);

        // a different jam has its own ordering space
        let other = upsert_unguarded(&conn, &tag("band_u", "r9", -1)).unwrap();
        assert_eq!(other.ordering, 1);
    }

    #[test]
    fn test_upsert_replaces_by_riff() {
        let (_dir, pool) = db::test_pool();
        let conn = pool.get().unwrap();

        upsert_unguarded(&conn, &tag("band_t", "r1", 5)).unwrap();
        let mut updated = tag("band_t", "r1", 5);
        updated.favour = 9;
        updated.note = "changed".to_owned();
        upsert_unguarded(&conn, &updated).unwrap();

        let stored = get_for_riff(&conn, &RiffId::from("r1")).unwrap().unwrap();
        assert_eq!(stored.favour, 9);
        assert_eq!(stored.note, "changed");
        assert_eq!(for_jam(&conn, &JamId::from("band_t")).unwrap().len(), 1);
    }

    #[test]
    fn test_for_jam_sorted_by_ordering() {
        let (_dir, pool) = db::test_pool();
        let conn = pool.get().unwrap();

        upsert_unguarded(&conn, &tag("band_t", "r1", 30)).unwrap();
        upsert_unguarded(&conn, &tag("band_t", "r2", 10)).unwrap();
        upsert_unguarded(&conn, &tag("band_t", "r3", 20)).unwrap();

        let tags = for_jam(&conn, &JamId::from("band_t")).unwrap();
        let ordering: Vec<i32> = tags.iter().map(|t| t.ordering).collect();
        assert_eq!(ordering, vec![10, 20, 30]);
    }
}
