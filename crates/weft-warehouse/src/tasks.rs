//! Warehouse worker tasks
//!
//! One enum over every kind of work the warehouse worker performs, each
//! variant carrying its own captured data. Network fetch and database
//! mutation are deliberately split: the `apply_*` functions are pure
//! ingestion over already-parsed documents, which is also what the tests
//! drive directly.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use weft_core::model::{JamId, RiffId, StemId, ROOT_NAMES, SCALE_FILE_NAMES};

use crate::api::types::{DocRow, RiffDocument, StemDocument, TypeCheckDocument};
use crate::api::ApiClient;
use crate::db::{self, ledger::StemLedgerKind, DbPool};
use crate::warehouse::{EventCallback, WarehouseEvent};

/// Batch ceiling for riff/stem detail pulls; keeps request bodies and
/// transaction sizes sane.
pub const SYNC_BATCH_SIZE: i64 = 40;

// ── result payloads ────────────────────────────────────────────────────────

/// Columnar summary of a jam's populated riffs, in creation order. All
/// arrays share one length.
#[derive(Debug, Default)]
pub struct JamSlice {
    pub jam_id: JamId,
    pub riff_ids: Vec<RiffId>,
    pub timestamps: Vec<i64>,
    pub user_hashes: Vec<u64>,
    pub roots: Vec<u8>,
    pub scales: Vec<u8>,
    pub bpms: Vec<f32>,
    /// Seconds since the previous riff; zero on the first entry
    pub delta_seconds: Vec<i32>,
    /// max(new stems unseen in the previous riff, |active-stem delta|)
    pub delta_stems: Vec<i8>,
}

impl JamSlice {
    pub fn len(&self) -> usize {
        self.riff_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.riff_ids.is_empty()
    }
}

/// Per-jam population counts across the whole warehouse.
#[derive(Debug, Default)]
pub struct ContentsReport {
    pub jam_ids: Vec<JamId>,
    pub populated_riffs: Vec<i64>,
    pub unpopulated_riffs: Vec<i64>,
    pub populated_stems: Vec<i64>,
    pub unpopulated_stems: Vec<i64>,
    /// Jams with riff rows but no stem rows yet; nothing has synced
    pub awaiting_initial_sync: Vec<bool>,
}

pub type JamSliceCallback = Arc<dyn Fn(&JamId, JamSlice) + Send + Sync>;
pub type ContentsReportCallback = Arc<dyn Fn(ContentsReport) + Send + Sync>;

// ── task enum ──────────────────────────────────────────────────────────────

pub struct TaskContext {
    pub pool: DbPool,
    pub api: Arc<ApiClient>,
    pub events: EventCallback,
}

pub enum WarehouseTask {
    /// Pull the complete riff-id list for a jam, inserting skeleton rows
    JamSnapshot { jam: JamId },
    /// Delete every row belonging to a jam
    JamPurge { jam: JamId },
    /// Delete only the skeleton riff rows, abandoning an in-flight sync
    JamSyncAbort { jam: JamId },
    /// Write a line-per-record snapshot of one jam to disk
    JamExport { jam: JamId, export_dir: PathBuf, jam_name: String },
    /// Build the columnar per-jam riff summary
    JamSlice { jam: JamId, callback: JamSliceCallback },
    /// Count populated/unpopulated rows across all jams
    ContentsReport { callback: Option<ContentsReportCallback> },
    /// Populate a batch of skeleton riffs, validating referenced stems
    GetRiffData { jam: JamId, riff_ids: Vec<RiffId> },
    /// Populate a batch of skeleton stems
    GetStemData { jam: JamId, stem_ids: Vec<StemId> },
}

impl WarehouseTask {
    pub fn tag(&self) -> &'static str {
        match self {
            WarehouseTask::JamSnapshot { .. } => "SNAPSHOT",
            WarehouseTask::JamPurge { .. } => "PURGE",
            WarehouseTask::JamSyncAbort { .. } => "SYNC-ABORT",
            WarehouseTask::JamExport { .. } => "EXPORT",
            WarehouseTask::JamSlice { .. } => "JAMSLICE",
            WarehouseTask::ContentsReport { .. } => "CONTENTS",
            WarehouseTask::GetRiffData { .. } => "RIFFDATA",
            WarehouseTask::GetStemData { .. } => "STEMDATA",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            WarehouseTask::JamSnapshot { jam } => {
                format!("[{}] fetching jam snapshot of [{jam}]", self.tag())
            }
            WarehouseTask::JamPurge { jam } => {
                format!("[{}] deleting all records for [{jam}]", self.tag())
            }
            WarehouseTask::JamSyncAbort { jam } => {
                format!("[{}] purging empty riff records for [{jam}]", self.tag())
            }
            WarehouseTask::JamExport { jam, .. } => {
                format!("[{}] exporting [{jam}] to disk", self.tag())
            }
            WarehouseTask::JamSlice { jam, .. } => {
                format!("[{}] extracting jam data for [{jam}]", self.tag())
            }
            WarehouseTask::ContentsReport { .. } => {
                format!("[{}] creating database contents report", self.tag())
            }
            WarehouseTask::GetRiffData { riff_ids, .. } => {
                format!("[{}] pulling {} riff details", self.tag(), riff_ids.len())
            }
            WarehouseTask::GetStemData { stem_ids, .. } => {
                format!("[{}] pulling {} stem details", self.tag(), stem_ids.len())
            }
        }
    }

    pub fn uses_network(&self) -> bool {
        matches!(
            self,
            WarehouseTask::JamSnapshot { .. }
                | WarehouseTask::GetRiffData { .. }
                | WarehouseTask::GetStemData { .. }
        )
    }

    /// Tasks that change what the contents report would say get one
    /// scheduled immediately rather than on the usual cycle.
    pub fn forces_content_report(&self) -> bool {
        matches!(
            self,
            WarehouseTask::JamSnapshot { .. }
                | WarehouseTask::JamPurge { .. }
                | WarehouseTask::JamSyncAbort { .. }
        )
    }

    pub fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        match self {
            WarehouseTask::JamSnapshot { jam } => {
                let snapshot = ctx.api.jam_full_snapshot(jam)?;
                let ids: Vec<RiffId> = snapshot.rows.into_iter().map(|row| row.id).collect();

                let mut conn = ctx.pool.get()?;
                let (before, after) = apply_jam_snapshot(&mut conn, jam, &ids)?;
                log::info!(
                    "[{}] {} riffs online, added {} to db",
                    self.tag(),
                    ids.len(),
                    after - before
                );
                Ok(())
            }

            WarehouseTask::JamPurge { jam } => {
                let mut conn = ctx.pool.get()?;
                let tx = conn.transaction()?;
                db::jams::delete(&tx, jam)?;
                db::riffs::delete_all_for_jam(&tx, jam)?;
                db::stems::delete_all_for_jam(&tx, jam)?;
                tx.commit()?;
                log::info!("[{}] wiped [{jam}] from db", self.tag());
                Ok(())
            }

            WarehouseTask::JamSyncAbort { jam } => {
                let conn = ctx.pool.get()?;
                db::riffs::delete_unpopulated_for_jam(&conn, jam)?;
                Ok(())
            }

            WarehouseTask::JamExport { jam, export_dir, jam_name } => {
                let conn = ctx.pool.get()?;
                let path = run_jam_export(&conn, jam, export_dir, jam_name)?;
                (ctx.events)(&WarehouseEvent::Info {
                    title: "Jam Export Success".to_owned(),
                    message: format!("written to {}", path.display()),
                });
                Ok(())
            }

            WarehouseTask::JamSlice { jam, callback } => {
                let conn = ctx.pool.get()?;
                let slice = run_jam_slice(&conn, jam)?;
                callback(jam, slice);
                Ok(())
            }

            WarehouseTask::ContentsReport { callback } => {
                let conn = ctx.pool.get()?;
                let report = run_contents_report(&conn)?;
                if let Some(callback) = callback {
                    callback(report);
                }
                Ok(())
            }

            WarehouseTask::GetRiffData { jam, riff_ids } => {
                log::info!("[{}] collecting riff data ..", self.tag());
                let details = ctx.api.riff_details(jam, riff_ids)?;

                // union of stem ids referenced across the batch, for one
                // mass validation pass
                let mut seen = HashSet::new();
                let mut to_validate = Vec::new();
                for row in &details.rows {
                    let Some(doc) = &row.doc else { continue };
                    let record = doc.to_record(jam);
                    for id in record.active_stem_ids() {
                        if seen.insert(id.clone()) {
                            to_validate.push(id);
                        }
                    }
                }
                log::info!("[{}] validating {} stems ..", self.tag(), to_validate.len());

                let validation = ctx.api.stem_type_check(jam, &to_validate)?;

                let mut conn = ctx.pool.get()?;
                apply_riff_batch(
                    &mut conn,
                    jam,
                    &details.rows,
                    &validation.rows,
                    ctx.api.config().allow_stems_without_version_data,
                )?;
                Ok(())
            }

            WarehouseTask::GetStemData { jam, stem_ids } => {
                log::info!("[{}] collecting stem data ..", self.tag());
                let details = ctx.api.stem_details(jam, stem_ids)?;
                let mut conn = ctx.pool.get()?;
                apply_stem_batch(&mut conn, jam, &details.rows)?;
                Ok(())
            }
        }
    }
}

// ── pure ingestion ─────────────────────────────────────────────────────────

/// Insert skeleton rows for every riff id in a snapshot. Returns the row
/// counts before and after; re-running on unchanged upstream state is a
/// no-op by construction.
pub fn apply_jam_snapshot(
    conn: &mut rusqlite::Connection,
    jam: &JamId,
    riff_ids: &[RiffId],
) -> anyhow::Result<(i64, i64)> {
    let before = db::riffs::count_in_jam(conn, jam)?;

    let tx = conn.transaction()?;
    for riff_id in riff_ids {
        db::riffs::insert_skeleton(&tx, riff_id, jam)?;
    }
    tx.commit()?;

    let after = db::riffs::count_in_jam(conn, jam)?;
    Ok((before, after))
}

/// Decide which stems from a validation sweep must not be ingested, writing
/// a ledger entry for each. Returns the rejected id set.
fn collect_rejected_stems(
    conn: &rusqlite::Connection,
    checks: &[DocRow<TypeCheckDocument>],
    allow_without_version: bool,
) -> anyhow::Result<HashSet<StemId>> {
    let mut rejected = HashSet::new();

    for row in checks {
        let key = StemId::new(row.lookup_key().to_owned());

        // key no longer resolves at all, presumably moderated away
        if let Some(error) = &row.error {
            log::warn!("stem [{key}] rejected, retrieval error ({error})");
            db::ledger::store_note(conn, &key, StemLedgerKind::RemovedId, &format!("[{error}]"))?;
            rejected.insert(key);
            continue;
        }

        let Some(doc) = &row.doc else {
            log::warn!("stem [{key}] rejected, row carried no document");
            db::ledger::store_note(conn, &key, StemLedgerKind::RemovedId, "[missing doc]")?;
            rejected.insert(key);
            continue;
        };

        // stems with no app version are usually damage, except genuinely
        // old ones that carry vintage inline attachment data instead
        let old_but_valid = doc.has_vintage_audio();
        if doc.app_version == 0 && !old_but_valid && !allow_without_version {
            log::warn!("stem [{}] rejected, no app version data", doc.id);
            db::ledger::store_note(conn, &doc.id, StemLedgerKind::RemovedId, "[no version data]")?;
            rejected.insert(doc.id.clone());
            continue;
        }

        if row.value.as_ref().is_some_and(|value| value.deleted) {
            log::warn!("stem [{}] rejected, deleted upstream", doc.id);
            db::ledger::store_note(conn, &doc.id, StemLedgerKind::RemovedId, "[deleted]")?;
            rejected.insert(doc.id.clone());
            continue;
        }

        // chat messages and other riffs have been seen masquerading as stems
        if doc.doc_type != "Loop" {
            log::warn!("stem [{}] rejected, wrong type ({})", doc.id, doc.doc_type);
            db::ledger::store_note(
                conn,
                &doc.id,
                StemLedgerKind::DamagedReference,
                &format!("[Ver:{}] wrong type [{}]", doc.app_version, doc.doc_type),
            )?;
            rejected.insert(doc.id.clone());
            continue;
        }

        if !doc.cdn_attachments.has_audio() && !old_but_valid {
            log::warn!("stem [{}] rejected, no audio attachment", doc.id);
            db::ledger::store_note(
                conn,
                &doc.id,
                StemLedgerKind::MissingAudio,
                &format!("[Ver:{}]", doc.app_version),
            )?;
            rejected.insert(doc.id.clone());
            continue;
        }
    }

    Ok(rejected)
}

/// Promote a batch of riff skeletons using fetched documents, stripping any
/// stems the validation pass rejected and seeding skeleton rows for the
/// rest. One transaction for all writes.
pub fn apply_riff_batch(
    conn: &mut rusqlite::Connection,
    jam: &JamId,
    riff_rows: &[DocRow<RiffDocument>],
    validation_rows: &[DocRow<TypeCheckDocument>],
    allow_without_version: bool,
) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;

    let rejected = collect_rejected_stems(&tx, validation_rows, allow_without_version)?;

    let mut updated = 0usize;
    for row in riff_rows {
        let Some(doc) = &row.doc else {
            log::warn!("riff row [{}] carried no document, skipping", row.lookup_key());
            continue;
        };

        let mut record = doc.to_record(jam);

        for slot in 0..record.stems.len() {
            if record.stems[slot].is_empty() {
                continue;
            }
            if rejected.contains(&record.stems[slot]) {
                log::info!(
                    "removing stem slot {slot} from [{}], marked invalid during validation",
                    record.id
                );
                record.stems[slot] = StemId::default();
                record.gains[slot] = 0.0;
            } else {
                // seed any newly referenced stems for a later detail pass
                db::stems::insert_skeleton(&tx, &record.stems[slot], jam)?;
            }
        }
        record.sync_active_flags();

        db::riffs::update_populated(&tx, &record)?;
        updated += 1;
    }

    tx.commit()?;
    log::info!("ingested {updated} rows of riff detail");
    Ok(updated)
}

/// Promote a batch of stem skeletons using fetched documents. One
/// transaction for all writes.
pub fn apply_stem_batch(
    conn: &mut rusqlite::Connection,
    jam: &JamId,
    stem_rows: &[DocRow<StemDocument>],
) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;

    let mut updated = 0usize;
    for row in stem_rows {
        let Some(doc) = &row.doc else {
            log::warn!("stem row [{}] carried no document, skipping", row.lookup_key());
            continue;
        };
        let Some(record) = doc.to_record(jam) else {
            log::warn!("stem [{}] has no usable audio attachment, skipping", doc.id);
            continue;
        };

        db::stems::update_populated(&tx, &record)?;
        updated += 1;
    }

    tx.commit()?;
    log::info!("ingested {updated} rows of stem detail");
    Ok(updated)
}

// ── reports ────────────────────────────────────────────────────────────────

fn hash_username(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Scan a jam's populated riffs in creation order into columnar arrays.
pub fn run_jam_slice(conn: &rusqlite::Connection, jam: &JamId) -> anyhow::Result<JamSlice> {
    let riff_count = db::riffs::count_populated(conn, jam, true)? as usize;

    let mut slice = JamSlice { jam_id: jam.clone(), ..JamSlice::default() };
    slice.riff_ids.reserve(riff_count);
    slice.timestamps.reserve(riff_count);

    let mut statement = conn.prepare(
        r#"SELECT RiffCID, CreationTime, UserName, Root, Scale, BPMrnd,
                  StemCID_1, StemCID_2, StemCID_3, StemCID_4,
                  StemCID_5, StemCID_6, StemCID_7, StemCID_8
           FROM Riffs
           WHERE OwnerJamCID IS ?1 AND CreationTime IS NOT NULL
           ORDER BY CreationTime"#,
    )?;

    let mut rows = statement.query(rusqlite::params![jam.as_str()])?;

    let mut previous_stems: HashSet<String> = HashSet::with_capacity(8);
    let mut previous_timestamp = 0i64;
    let mut previous_active = 0i8;
    let mut first = true;

    while let Some(row) = rows.next()? {
        let riff_id: String = row.get(0)?;
        let timestamp: i64 = row.get(1)?;
        let user: Option<String> = row.get(2)?;
        let root: u8 = row.get::<_, Option<u8>>(3)?.unwrap_or(0);
        let scale: u8 = row.get::<_, Option<u8>>(4)?.unwrap_or(0);
        let bpm: f32 = row.get::<_, Option<f32>>(5)?.unwrap_or(0.0);

        let mut stems: Vec<String> = Vec::with_capacity(8);
        for column in 6..14 {
            stems.push(row.get::<_, Option<String>>(column)?.unwrap_or_default());
        }

        let mut active = 0i8;
        let mut unseen = 0i8;
        for stem in &stems {
            if !stem.is_empty() {
                active += 1;
            }
            if !previous_stems.contains(stem) {
                unseen += 1;
            }
        }

        slice.riff_ids.push(RiffId::new(riff_id));
        slice.timestamps.push(timestamp);
        slice.user_hashes.push(hash_username(user.as_deref().unwrap_or("")));
        slice.roots.push(root);
        slice.scales.push(scale);
        slice.bpms.push(bpm);

        if first {
            slice.delta_seconds.push(0);
            slice.delta_stems.push(0);
            first = false;
        } else {
            let active_delta = (active - previous_active).abs();
            slice.delta_seconds.push((timestamp - previous_timestamp) as i32);
            slice.delta_stems.push(unseen.max(active_delta));
        }

        previous_timestamp = timestamp;
        previous_active = active;
        previous_stems.clear();
        previous_stems.extend(stems);
    }

    Ok(slice)
}

/// Per-jam population counts in one grouped join, plus a marker for jams
/// that have riff rows but no stem rows yet (no sync pass has landed).
pub fn run_contents_report(conn: &rusqlite::Connection) -> anyhow::Result<ContentsReport> {
    let mut report = ContentsReport::default();

    // jams visible in Riffs, plus named jams with no rows at all yet;
    // anything the join below misses is awaiting its first sync pass and is
    // reported as 0/0/0/0 so the user sees it will be considered soon
    let mut pending: HashSet<String> = db::riffs::distinct_jam_ids(conn)?
        .into_iter()
        .map(|jam| jam.0)
        .collect();
    for (jam, _) in db::jams::extract_dictionary(conn)? {
        pending.insert(jam.0);
    }

    let mut statement = conn.prepare(
        r#"SELECT a.OwnerJamCID, a.FilledRiffs, a.EmptyRiffs, b.FilledStems, b.EmptyStems
           FROM
           (
               SELECT Riffs.OwnerJamCID,
                   count(case when Riffs.CreationTime is null then 1 end) as EmptyRiffs,
                   count(case when Riffs.CreationTime is not null then 1 end) as FilledRiffs
               FROM Riffs
               GROUP BY Riffs.OwnerJamCID
           ) as a
           JOIN
           (
               SELECT Stems.OwnerJamCID,
                   count(case when Stems.CreationTime is null then 1 end) as EmptyStems,
                   count(case when Stems.CreationTime is not null then 1 end) as FilledStems
               FROM Stems
               GROUP BY Stems.OwnerJamCID
           ) as b
           ON a.OwnerJamCID = b.OwnerJamCID"#,
    )?;

    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let jam: String = row.get(0)?;
        pending.remove(&jam);

        report.jam_ids.push(JamId::new(jam));
        report.populated_riffs.push(row.get(1)?);
        report.unpopulated_riffs.push(row.get(2)?);
        report.populated_stems.push(row.get(3)?);
        report.unpopulated_stems.push(row.get(4)?);
        report.awaiting_initial_sync.push(false);
    }

    for jam in pending {
        report.jam_ids.push(JamId::new(jam));
        report.populated_riffs.push(0);
        report.unpopulated_riffs.push(0);
        report.populated_stems.push(0);
        report.unpopulated_stems.push(0);
        report.awaiting_initial_sync.push(true);
    }

    Ok(report)
}

// ── export ─────────────────────────────────────────────────────────────────

fn sanitise_for_path(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Shortest-round-trip decimal plus the raw IEEE bits, so external tooling
/// can reproduce the value exactly.
fn lossless_f32(value: f32) -> String {
    format!("{}, \"{:08x}\"", value, value.to_bits())
}

/// Write a one-line-per-record snapshot of a jam. The filename is
/// deterministic: `ldx.<jamid>.<sanitised_name>.yaml`.
pub fn run_jam_export(
    conn: &rusqlite::Connection,
    jam: &JamId,
    export_dir: &std::path::Path,
    jam_name: &str,
) -> anyhow::Result<PathBuf> {
    let filename = format!("ldx.{}.{}.yaml", jam, sanitise_for_path(jam_name));
    let path = export_dir.join(&filename);
    log::info!("exporting [{jam_name}] to [{}]", path.display());

    std::fs::create_dir_all(export_dir)?;
    let file = std::fs::File::create(&path).context("creating export file")?;
    let mut out = std::io::BufWriter::new(file);

    writeln!(out, "export_time_unix: {}", chrono::Utc::now().timestamp())?;
    writeln!(out, "export_weft_version: \"{}\"", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "jam_name: \"{jam_name}\"")?;
    writeln!(out, "jam_couch_id: \"{jam}\"")?;

    writeln!(out, "# riffs schema")?;
    writeln!(
        out,
        "# id: [user, creation unix time, root, root name, scale, scale name, BPS (dec, bits), \
         BPM (dec, bits), bar length, app version, 8x [stem id, gain (dec, bits), enabled], magnitude]"
    )?;
    writeln!(out, "riffs:")?;
    for riff_id in db::riffs::all_ids_by_time(conn, jam)? {
        let Some(riff) = db::riffs::get_single(conn, &riff_id)? else {
            log::error!("unable to decode riff [{riff_id}] from database during export");
            continue;
        };

        let mut line = format!(
            " \"{}\": [\"{}\", {}, {}, \"{}\", {}, \"{}\", {}, {}, {}, {}, ",
            riff.id,
            riff.user,
            riff.creation_time,
            riff.root,
            ROOT_NAMES.get(riff.root as usize).copied().unwrap_or("?"),
            riff.scale,
            SCALE_FILE_NAMES.get(riff.scale as usize).copied().unwrap_or("?"),
            lossless_f32(riff.bps),
            lossless_f32(riff.bpm_rnd),
            riff.bar_length,
            riff.app_version,
        );
        for slot in 0..riff.stems.len() {
            line.push_str(&format!(
                "[\"{}\", {}, {}], ",
                riff.stems[slot],
                lossless_f32(riff.gains[slot]),
                riff.stems_on[slot],
            ));
        }
        writeln!(out, "{line}{}]", riff.magnitude)?;
    }

    writeln!(out, "# stems schema")?;
    writeln!(
        out,
        "# id: [endpoint, bucket, key, MIME, length bytes, sample rate, creation unix time, \
         preset, user, colour, BPS (dec, bits), BPM (dec, bits), length 16ths, original pitch, \
         bar length, is-drum, is-note, is-bass, is-mic]"
    )?;
    writeln!(out, "stems:")?;
    for stem_id in db::stems::all_ids_for_jam(conn, jam)? {
        let Some(stem) = db::stems::get_single(conn, &stem_id)? else {
            log::error!("unable to decode stem [{stem_id}] from database during export");
            continue;
        };

        writeln!(
            out,
            " \"{}\": [\"{}\", \"{}\", \"{}\", \"{}\", {}, {}, {}, \"{}\", \"{}\", \"{}\", {}, {}, {}, {}, {}, {}, {}, {}, {}]",
            stem.id,
            stem.file_endpoint,
            stem.file_bucket,
            stem.file_key,
            stem.file_mime,
            stem.file_length_bytes,
            stem.sample_rate,
            stem.creation_time,
            stem.preset,
            stem.user,
            stem.colour,
            lossless_f32(stem.bps),
            lossless_f32(stem.bpm_rnd),
            stem.length_16ths,
            stem.original_pitch,
            stem.bar_length,
            stem.instrument.drum,
            stem.instrument.note,
            stem.instrument.bass,
            stem.instrument.mic,
        )?;
    }

    out.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::{ApiConfig, Auth};
    use crate::db;
    use serde_json::json;

    const JAM: &str = "band_test01";

    fn jam() -> JamId {
        JamId::from(JAM)
    }

    fn riff_row(id: &str, created_ms: u64, stems: &[(usize, &str, f32)]) -> DocRow<RiffDocument> {
        let mut playback =
            vec![json!({"slot": {"current": {"on": false, "currentLoop": "", "gain": 0.0}}}); 8];
        for (slot, stem, gain) in stems {
            playback[*slot] =
                json!({"slot": {"current": {"on": true, "currentLoop": stem, "gain": gain}}});
        }
        serde_json::from_value(json!({
            "key": id,
            "id": id,
            "doc": {
                "_id": id,
                "state": { "bps": 2.0, "barLength": 4.0, "playback": playback },
                "userName": "tester",
                "created": created_ms,
                "root": 1,
                "scale": 2,
                "app_version": 7,
                "magnitude": 0.5
            }
        }))
        .unwrap()
    }

    fn check_row(id: &str, doc_type: &str) -> DocRow<TypeCheckDocument> {
        serde_json::from_value(json!({
            "key": id,
            "id": id,
            "doc": {
                "_id": id,
                "type": doc_type,
                "app_version": 7,
                "cdn_attachments": {
                    "oggAudio": { "endpoint": "att.example.net", "key": "k", "url": "", "length": 64 }
                }
            }
        }))
        .unwrap()
    }

    fn stem_row(id: &str, created_ms: u64) -> DocRow<StemDocument> {
        serde_json::from_value(json!({
            "key": id,
            "id": id,
            "doc": {
                "_id": id,
                "cdn_attachments": {
                    "oggAudio": {
                        "endpoint": "att.example.net",
                        "key": "attachments/oggAudio/x",
                        "url": "",
                        "length": 4242
                    }
                },
                "bps": 2.0,
                "length16ths": 16.0,
                "originalPitch": 440.0,
                "barLength": 4.0,
                "presetName": "bass01",
                "creatorUserName": "tester",
                "primaryColour": "ff8040",
                "sampleRate": 44100.0,
                "created": created_ms,
                "isNote": true
            }
        }))
        .unwrap()
    }

    fn riff_ids(ids: &[&str]) -> Vec<RiffId> {
        ids.iter().map(|id| RiffId::from(*id)).collect()
    }

    fn test_ctx(pool: &DbPool) -> (TaskContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext {
            pool: pool.clone(),
            api: Arc::new(ApiClient::new(
                ApiConfig::default(),
                Auth::default(),
                dir.path().to_path_buf(),
            )),
            events: Arc::new(|_| {}),
        };
        (ctx, dir)
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        let ids = riff_ids(&["r1", "r2", "r3"]);
        let (before, after) = apply_jam_snapshot(&mut conn, &jam(), &ids).unwrap();
        assert_eq!((before, after), (0, 3));

        // same upstream state again: row count must hold steady
        for _ in 0..3 {
            let (before, after) = apply_jam_snapshot(&mut conn, &jam(), &ids).unwrap();
            assert_eq!((before, after), (3, 3));
        }

        assert_eq!(db::riffs::count_populated(&conn, &jam(), false).unwrap(), 3);
        assert_eq!(db::riffs::count_populated(&conn, &jam(), true).unwrap(), 0);
    }

    #[test]
    fn test_riff_and_stem_round_trip() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        apply_jam_snapshot(&mut conn, &jam(), &riff_ids(&["r1"])).unwrap();
        apply_riff_batch(
            &mut conn,
            &jam(),
            &[riff_row("r1", 1_650_000_000_000, &[(0, "s1", 0.75)])],
            &[check_row("s1", "Loop")],
            false,
        )
        .unwrap();

        // the riff ingest seeded a stem skeleton to chase later
        assert_eq!(db::stems::count_populated(&conn, &jam(), false).unwrap(), 1);

        apply_stem_batch(&mut conn, &jam(), &[stem_row("s1", 1_650_000_100_000)]).unwrap();

        let riff = db::riffs::get_single(&conn, &RiffId::from("r1")).unwrap().unwrap();
        assert_eq!(riff.creation_time, 1_650_000_000);
        assert_eq!(riff.bps, 2.0);
        assert_eq!(riff.bpm_rnd, 120.0);
        assert_eq!(riff.user, "tester");
        assert!(riff.stems_on[0]);
        assert_eq!(riff.stems[0], weft_core::model::StemId::from("s1"));
        assert_eq!(riff.gains[0], 0.75);
        assert_eq!(riff.active_stem_ids().len(), 1);

        let stem = db::stems::get_single(&conn, &weft_core::model::StemId::from("s1"))
            .unwrap()
            .unwrap();
        assert_eq!(stem.creation_time, 1_650_000_100);
        assert_eq!(stem.file_endpoint, "att.example.net");
        assert_eq!(stem.file_length_bytes, 4242);
        assert!(stem.instrument.note);
        assert!(!stem.instrument.drum);
        assert_eq!(stem.preset, "bass01");
        assert_eq!(stem.sample_rate, 44100);
    }

    #[test]
    fn test_validation_rejects_chat_message_stems() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        apply_jam_snapshot(&mut conn, &jam(), &riff_ids(&["r1"])).unwrap();
        apply_riff_batch(
            &mut conn,
            &jam(),
            &[riff_row("r1", 1_650_000_000_000, &[(0, "s1", 0.8), (3, "s2", 0.6)])],
            &[check_row("s1", "Loop"), check_row("s2", "ChatMessage")],
            false,
        )
        .unwrap();

        let riff = db::riffs::get_single(&conn, &RiffId::from("r1")).unwrap().unwrap();
        // the healthy stem survives, the chat message is stripped out
        assert!(riff.stems_on[0]);
        assert!(!riff.stems_on[3]);
        assert!(riff.stems[3].is_empty());

        let entry = db::ledger::get_for_stem(&conn, &weft_core::model::StemId::from("s2"))
            .unwrap()
            .expect("ledger entry for rejected stem");
        assert_eq!(entry.0, StemLedgerKind::DamagedReference);
        assert!(entry.1.contains("ChatMessage"));

        // only the good stem was seeded as a skeleton
        assert!(db::stems::get_single(&conn, &weft_core::model::StemId::from("s2"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_purge_removes_every_trace_of_a_jam() {
        let (_dir, pool) = db::test_pool();
        {
            let mut conn = pool.get().unwrap();
            db::jams::upsert_name(&conn, &jam(), "Some Jam").unwrap();
            apply_jam_snapshot(&mut conn, &jam(), &riff_ids(&["r1", "r2"])).unwrap();
            apply_riff_batch(
                &mut conn,
                &jam(),
                &[riff_row("r1", 1_650_000_000_000, &[(0, "s1", 1.0)])],
                &[check_row("s1", "Loop")],
                false,
            )
            .unwrap();
        }

        let (ctx, _quarantine) = test_ctx(&pool);
        WarehouseTask::JamPurge { jam: jam() }.run(&ctx).unwrap();

        let conn = pool.get().unwrap();
        assert_eq!(db::riffs::count_in_jam(&conn, &jam()).unwrap(), 0);
        assert_eq!(db::stems::count_populated(&conn, &jam(), false).unwrap(), 0);
        assert_eq!(db::stems::count_populated(&conn, &jam(), true).unwrap(), 0);
        assert!(db::jams::public_name(&conn, &jam()).unwrap().is_none());

        let report = run_contents_report(&conn).unwrap();
        assert!(report.jam_ids.is_empty());
    }

    #[test]
    fn test_jam_slice_columns_and_deltas() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        apply_jam_snapshot(&mut conn, &jam(), &riff_ids(&["r1", "r2", "r3"])).unwrap();
        apply_riff_batch(
            &mut conn,
            &jam(),
            &[
                riff_row("r1", 1_000_000, &[(0, "s1", 1.0), (1, "s2", 1.0)]),
                riff_row("r2", 1_010_000, &[(0, "s1", 1.0), (1, "s3", 1.0)]),
                riff_row("r3", 1_030_000, &[(1, "s3", 1.0)]),
            ],
            &[
                check_row("s1", "Loop"),
                check_row("s2", "Loop"),
                check_row("s3", "Loop"),
            ],
            false,
        )
        .unwrap();

        let slice = run_jam_slice(&conn, &jam()).unwrap();

        assert_eq!(slice.len(), 3);
        for arrays in [
            slice.timestamps.len(),
            slice.user_hashes.len(),
            slice.roots.len(),
            slice.scales.len(),
            slice.bpms.len(),
            slice.delta_seconds.len(),
            slice.delta_stems.len(),
        ] {
            assert_eq!(arrays, 3);
        }

        // creation order, monotonically non-decreasing
        assert!(slice.timestamps.windows(2).all(|pair| pair[0] <= pair[1]));

        // first entry has no deltas
        assert_eq!(slice.delta_seconds[0], 0);
        assert_eq!(slice.delta_stems[0], 0);

        // r2: one stem unseen (s3), same active count
        assert_eq!(slice.delta_seconds[1], 10);
        assert_eq!(slice.delta_stems[1], 1);

        // r3: nothing unseen, one fewer active stem
        assert_eq!(slice.delta_seconds[2], 20);
        assert_eq!(slice.delta_stems[2], 1);

        // same user throughout
        assert!(slice.user_hashes.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_contents_report_covers_all_jams() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        let jam_a = JamId::from("band_aaaa");
        let jam_b = JamId::from("band_bbbb");
        let jam_c = JamId::from("band_cccc");

        // jam A: one populated riff (which seeds a stem), one skeleton
        apply_jam_snapshot(&mut conn, &jam_a, &riff_ids(&["ra1", "ra2"])).unwrap();
        apply_riff_batch(
            &mut conn,
            &jam_a,
            &[riff_row("ra1", 1_650_000_000_000, &[(0, "sa1", 1.0)])],
            &[check_row("sa1", "Loop")],
            false,
        )
        .unwrap();

        // jam B: snapshot only, no stems discovered yet
        apply_jam_snapshot(&mut conn, &jam_b, &riff_ids(&["rb1", "rb2"])).unwrap();

        // jam C: named but never synced at all
        db::jams::upsert_name(&conn, &jam_c, "Untouched").unwrap();

        let report = run_contents_report(&conn).unwrap();

        let index_of = |jam: &JamId| {
            report
                .jam_ids
                .iter()
                .position(|id| id == jam)
                .unwrap_or_else(|| panic!("jam {jam} missing from report"))
        };

        let a = index_of(&jam_a);
        assert_eq!(report.populated_riffs[a], 1);
        assert_eq!(report.unpopulated_riffs[a], 1);
        assert_eq!(report.unpopulated_stems[a], 1);
        assert!(!report.awaiting_initial_sync[a]);

        // riff rows but no stem rows yet: flagged as awaiting initial sync
        let b = index_of(&jam_b);
        assert!(report.awaiting_initial_sync[b]);

        // known by name only: still surfaced, zeroed out
        let c = index_of(&jam_c);
        assert!(report.awaiting_initial_sync[c]);
        assert_eq!(report.populated_riffs[c], 0);

        // every jam holding any riff row is covered by the report
        for jam_with_riffs in db::riffs::distinct_jam_ids(&conn).unwrap() {
            assert!(report.jam_ids.contains(&jam_with_riffs));
        }
    }

    #[test]
    fn test_export_writes_deterministic_snapshot() {
        let (_dir, pool) = db::test_pool();
        let mut conn = pool.get().unwrap();

        apply_jam_snapshot(&mut conn, &jam(), &riff_ids(&["r1"])).unwrap();
        apply_riff_batch(
            &mut conn,
            &jam(),
            &[riff_row("r1", 1_650_000_000_000, &[(0, "s1", 0.75)])],
            &[check_row("s1", "Loop")],
            false,
        )
        .unwrap();
        apply_stem_batch(&mut conn, &jam(), &[stem_row("s1", 1_650_000_100_000)]).unwrap();

        let export_dir = tempfile::tempdir().unwrap();
        let path = run_jam_export(&conn, &jam(), export_dir.path(), "Cool Jam!").unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("ldx.{JAM}.cool_jam_.yaml")
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("riffs:"));
        assert!(contents.contains("stems:"));
        assert!(contents.contains("\"r1\":"));
        assert!(contents.contains("\"s1\":"));
        // bps 2.0 carries its exact bit pattern for round-trip verification
        assert!(contents.contains(&format!("\"{:08x}\"", 2.0f32.to_bits())));
    }
}
