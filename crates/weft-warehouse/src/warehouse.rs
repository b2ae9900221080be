//! Warehouse service
//!
//! Owns the SQLite pool and the single background worker thread. Work
//! arrives as tasks on a multi-producer queue; when the queue runs dry and
//! credentials are available the worker hunts for unpopulated rows to batch
//! up, stems before riffs. Task failure pauses the worker and surfaces a
//! user-visible event; un-pausing resumes where it left off.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use weft_core::model::{JamId, RiffComplete, RiffId, RiffTag, StemId, StemRecord};

use crate::api::ApiClient;
use crate::config::{ApiConfig, Auth, StoragePaths};
use crate::db::{self, DbPool};
use crate::tasks::{
    ContentsReportCallback, JamSliceCallback, TaskContext, WarehouseTask, SYNC_BATCH_SIZE,
};

/// Completed tasks between automatic contents-report refreshes.
const REPORT_EVERY_N_TASKS: i32 = 3;

/// User-visible notifications emitted by the warehouse.
#[derive(Debug, Clone)]
pub enum WarehouseEvent {
    Info { title: String, message: String },
    Error { title: String, message: String },
}

pub type EventCallback = Arc<dyn Fn(&WarehouseEvent) + Send + Sync>;

/// Progress line for a status bar: busy flag plus a description.
pub type WorkUpdateCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

pub type TagUpdateCallback = Arc<dyn Fn(&RiffTag) + Send + Sync>;
pub type TagRemovedCallback = Arc<dyn Fn(&RiffId) + Send + Sync>;
/// Brackets a batch of tag updates (true at start, false at end).
pub type TagBatchingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Callbacks waiting to be moved onto the worker thread. Installation is
/// deferred so the hot path never contends with the installer: setters write
/// here and the worker swaps them live at the top of its loop.
#[derive(Default)]
struct StagedCallbacks {
    work_update: Option<WorkUpdateCallback>,
    contents_report: Option<ContentsReportCallback>,
}

#[derive(Default)]
struct TagCallbacks {
    update: Option<TagUpdateCallback>,
    removed: Option<TagRemovedCallback>,
    batching: Option<TagBatchingCallback>,
}

pub struct Warehouse {
    pool: DbPool,
    api: Arc<ApiClient>,
    tasks: crossbeam_channel::Sender<WarehouseTask>,
    run: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    staged: Arc<Mutex<StagedCallbacks>>,
    tag_callbacks: Mutex<TagCallbacks>,
    change_index: Arc<Mutex<HashMap<JamId, u64>>>,
    worker: Option<JoinHandle<()>>,
}

impl Warehouse {
    pub fn new(
        storage: &StoragePaths,
        api_config: ApiConfig,
        auth: Auth,
        events: EventCallback,
    ) -> anyhow::Result<Self> {
        let pool = db::open_pool(&storage.warehouse_db_path())?;
        let api = Arc::new(ApiClient::new(api_config, auth, storage.quarantine_dir()));

        let (task_tx, task_rx) = crossbeam_channel::unbounded::<WarehouseTask>();
        let run = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let staged = Arc::new(Mutex::new(StagedCallbacks::default()));
        let change_index = Arc::new(Mutex::new(HashMap::new()));

        let worker_state = WorkerState {
            pool: pool.clone(),
            api: api.clone(),
            task_rx,
            task_tx: task_tx.clone(),
            run: run.clone(),
            paused: paused.clone(),
            staged: staged.clone(),
            change_index: change_index.clone(),
            events: events.clone(),
        };

        let worker = std::thread::Builder::new()
            .name("weft-warehouse".to_string())
            .spawn(move || worker_loop(worker_state))
            .expect("failed to spawn warehouse worker");

        Ok(Self {
            pool,
            api,
            tasks: task_tx,
            run,
            paused,
            staged,
            tag_callbacks: Mutex::new(TagCallbacks::default()),
            change_index,
            worker: Some(worker),
        })
    }

    pub fn api(&self) -> Arc<ApiClient> {
        self.api.clone()
    }

    pub fn has_full_network_access(&self) -> bool {
        self.api.has_auth()
    }

    // ── callback installation ──────────────────────────────────────────────

    pub fn set_callback_work_report(&self, callback: WorkUpdateCallback) {
        self.staged.lock().unwrap().work_update = Some(callback);
    }

    pub fn set_callback_contents_report(&self, callback: ContentsReportCallback) {
        self.staged.lock().unwrap().contents_report = Some(callback);
    }

    pub fn set_callback_tag_update(
        &self,
        update: TagUpdateCallback,
        batching: TagBatchingCallback,
    ) {
        let mut callbacks = self.tag_callbacks.lock().unwrap();
        callbacks.update = Some(update);
        callbacks.batching = Some(batching);
    }

    pub fn set_callback_tag_removed(&self, callback: TagRemovedCallback) {
        self.tag_callbacks.lock().unwrap().removed = Some(callback);
    }

    pub fn clear_all_callbacks(&self) {
        *self.staged.lock().unwrap() = StagedCallbacks::default();
        *self.tag_callbacks.lock().unwrap() = TagCallbacks::default();
    }

    // ── worker control ─────────────────────────────────────────────────────

    pub fn worker_toggle_pause(&self) {
        let paused = !self.paused.load(Ordering::Acquire);
        self.paused.store(paused, Ordering::Release);
        log::info!("warehouse worker {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    // ── task submission ────────────────────────────────────────────────────

    pub fn request_contents_report(&self, callback: ContentsReportCallback) {
        self.enqueue(WarehouseTask::ContentsReport { callback: Some(callback) });
    }

    /// Start (or refresh) mirroring a jam. Refused without credentials;
    /// skeleton-only browsing of already-synced data needs none.
    pub fn add_or_update_jam_snapshot(&self, jam: &JamId) {
        if jam.is_empty() {
            log::error!("cannot snapshot an empty jam id");
            return;
        }
        if !self.has_full_network_access() {
            log::error!("cannot snapshot [{jam}] with no upstream credentials");
            return;
        }
        self.enqueue(WarehouseTask::JamSnapshot { jam: jam.clone() });
    }

    pub fn request_jam_slice(&self, jam: &JamId, callback: JamSliceCallback) {
        if jam.is_empty() {
            log::error!("empty jam id passed for slice request");
            return;
        }
        self.enqueue(WarehouseTask::JamSlice { jam: jam.clone(), callback });
    }

    pub fn request_jam_purge(&self, jam: &JamId) {
        if jam.is_empty() {
            log::error!("empty jam id passed for purge");
            return;
        }
        self.enqueue(WarehouseTask::JamPurge { jam: jam.clone() });
    }

    pub fn request_jam_sync_abort(&self, jam: &JamId) {
        if jam.is_empty() {
            log::error!("empty jam id passed for sync abort");
            return;
        }
        self.enqueue(WarehouseTask::JamSyncAbort { jam: jam.clone() });
    }

    pub fn request_jam_export(&self, jam: &JamId, export_dir: &Path, jam_name: &str) {
        if jam.is_empty() {
            log::error!("empty jam id passed for export");
            return;
        }
        self.enqueue(WarehouseTask::JamExport {
            jam: jam.clone(),
            export_dir: export_dir.to_path_buf(),
            jam_name: jam_name.to_owned(),
        });
    }

    fn enqueue(&self, task: WarehouseTask) {
        if self.tasks.send(task).is_err() {
            log::error!("warehouse worker is gone, task dropped");
        }
    }

    // ── read paths (any thread) ────────────────────────────────────────────

    pub fn upsert_jam_name(&self, jam: &JamId, display_name: &str) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        db::jams::upsert_name(&conn, jam, display_name)?;
        Ok(())
    }

    pub fn extract_jam_dictionary(&self) -> anyhow::Result<Vec<(JamId, String)>> {
        let conn = self.pool.get()?;
        Ok(db::jams::extract_dictionary(&conn)?)
    }

    /// Fully joined riff: jam name, riff row, and populated rows for every
    /// active stem slot. A missing stem row on an active slot is a failure
    /// (the database is inconsistent) and yields `None`.
    pub fn fetch_single_riff(&self, riff_id: &RiffId) -> anyhow::Result<Option<RiffComplete>> {
        let conn = self.pool.get()?;

        let Some(riff) = db::riffs::get_single(&conn, riff_id)? else {
            return Ok(None);
        };

        let mut complete = RiffComplete {
            jam: weft_core::model::JamInfo {
                id: riff.jam_id.clone(),
                display_name: db::jams::public_name(&conn, &riff.jam_id)?.unwrap_or_default(),
            },
            riff,
            stems: Default::default(),
        };

        for slot in 0..complete.riff.stems.len() {
            if !complete.riff.stems_on[slot] {
                continue;
            }
            match db::stems::get_single(&conn, &complete.riff.stems[slot])? {
                Some(stem) => complete.stems[slot] = Some(stem),
                None => {
                    log::error!(
                        "riff [{riff_id}] references stem [{}] with no row",
                        complete.riff.stems[slot]
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(complete))
    }

    pub fn fetch_single_stem(&self, stem_id: &StemId) -> anyhow::Result<Option<StemRecord>> {
        let conn = self.pool.get()?;
        Ok(db::stems::get_single(&conn, stem_id)?)
    }

    pub fn fetch_all_stems_for_jam(&self, jam: &JamId) -> anyhow::Result<Vec<StemId>> {
        let conn = self.pool.get()?;
        Ok(db::stems::all_ids_for_jam(&conn, jam)?)
    }

    pub fn fetch_all_stems(&self) -> anyhow::Result<Vec<StemId>> {
        let conn = self.pool.get()?;
        Ok(db::stems::all_ids(&conn)?)
    }

    /// Atomic swap of one stem slot on a riff row; data-repair support.
    pub fn patch_riff_stem_record(
        &self,
        jam: &JamId,
        riff: &RiffId,
        slot: usize,
        new_stem: &StemId,
    ) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        let patched = db::riffs::patch_stem_slot(&conn, jam, riff, slot, new_stem)?;
        if patched {
            self.bump_change_index(jam);
        }
        Ok(patched)
    }

    // ── tags ───────────────────────────────────────────────────────────────

    pub fn upsert_tag(&self, tag: &RiffTag) -> anyhow::Result<RiffTag> {
        let conn = self.pool.get()?;
        let resolved = db::tags::upsert_unguarded(&conn, tag)?;
        if let Some(callback) = &self.tag_callbacks.lock().unwrap().update {
            callback(&resolved);
        }
        Ok(resolved)
    }

    pub fn remove_tag(&self, tag: &RiffTag) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        db::tags::remove(&conn, &tag.riff_id)?;
        if let Some(callback) = &self.tag_callbacks.lock().unwrap().removed {
            callback(&tag.riff_id);
        }
        Ok(())
    }

    pub fn is_riff_tagged(&self, riff: &RiffId) -> anyhow::Result<Option<RiffTag>> {
        let conn = self.pool.get()?;
        Ok(db::tags::get_for_riff(&conn, riff)?)
    }

    pub fn fetch_tags_for_jam(&self, jam: &JamId) -> anyhow::Result<Vec<RiffTag>> {
        let conn = self.pool.get()?;
        Ok(db::tags::for_jam(&conn, jam)?)
    }

    pub fn batch_update_tags(&self, tags: &[RiffTag]) -> anyhow::Result<()> {
        log::info!("tags: batch updating {} items", tags.len());
        let callbacks = self.tag_callbacks.lock().unwrap();
        if let Some(batching) = &callbacks.batching {
            batching(true);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for tag in tags {
            let resolved = db::tags::upsert_unguarded(&tx, tag)?;
            if let Some(update) = &callbacks.update {
                update(&resolved);
            }
        }
        tx.commit()?;

        if let Some(batching) = &callbacks.batching {
            batching(false);
        }
        Ok(())
    }

    pub fn batch_remove_all_tags(&self, jam: &JamId) -> anyhow::Result<()> {
        log::info!("tags: removing all tags for {jam}");
        let callbacks = self.tag_callbacks.lock().unwrap();
        if let Some(batching) = &callbacks.batching {
            batching(true);
        }
        let conn = self.pool.get()?;
        db::tags::remove_all_for_jam(&conn, jam)?;
        if let Some(batching) = &callbacks.batching {
            batching(false);
        }
        Ok(())
    }

    /// Whether any skeleton rows remain anywhere; drives CLI completion.
    pub fn has_unpopulated_rows(&self) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        Ok(db::stems::find_unpopulated(&conn)?.is_some()
            || db::riffs::find_unpopulated(&conn)?.is_some())
    }

    // ── change index ───────────────────────────────────────────────────────

    /// Cheap "has anything about this jam changed" marker for UI layers;
    /// bumped whenever a batch of data about the jam is written.
    pub fn change_index_for_jam(&self, jam: &JamId) -> Option<u64> {
        self.change_index.lock().unwrap().get(jam).copied()
    }

    fn bump_change_index(&self, jam: &JamId) {
        bump_change_index_map(&self.change_index, jam);
    }
}

impl Drop for Warehouse {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Ok(conn) = self.pool.get() {
            db::optimize(&conn);
        }
    }
}

fn bump_change_index_map(map: &Mutex<HashMap<JamId, u64>>, jam: &JamId) {
    let mut index = map.lock().unwrap();
    *index.entry(jam.clone()).or_insert(0) += 1;
}

// ── worker thread ──────────────────────────────────────────────────────────

struct WorkerState {
    pool: DbPool,
    api: Arc<ApiClient>,
    task_rx: crossbeam_channel::Receiver<WarehouseTask>,
    task_tx: crossbeam_channel::Sender<WarehouseTask>,
    run: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    staged: Arc<Mutex<StagedCallbacks>>,
    change_index: Arc<Mutex<HashMap<JamId, u64>>>,
    events: EventCallback,
}

fn worker_loop(state: WorkerState) {
    log::info!("warehouse worker thread started");

    let mut rng = rand::thread_rng();
    let mut work_callback: Option<WorkUpdateCallback> = None;
    let mut contents_callback: Option<ContentsReportCallback> = None;
    let mut cycles_before_report = 0i32;
    let mut scraping_running = false;

    let ctx = TaskContext {
        pool: state.pool.clone(),
        api: state.api.clone(),
        events: state.events.clone(),
    };

    while state.run.load(Ordering::Acquire) {
        // a gentle baseline pace when idle, and stochastic spacing between
        // network calls when busy
        std::thread::sleep(Duration::from_millis(rng.gen_range(250..=700)));

        // move freshly staged callbacks live; a new contents-report consumer
        // gets a report scheduled immediately
        {
            let mut staged = state.staged.lock().unwrap();
            if let Some(callback) = staged.contents_report.take() {
                contents_callback = Some(callback);
                cycles_before_report = 0;
            }
            if let Some(callback) = staged.work_update.take() {
                work_callback = Some(callback);
            }
        }

        let try_enqueue_report = |cycles: &mut i32, force: bool| {
            *cycles -= 1;
            if *cycles <= 0 || force {
                let _ = state.task_tx.send(WarehouseTask::ContentsReport {
                    callback: contents_callback.clone(),
                });
                *cycles = REPORT_EVERY_N_TASKS;
            }
        };

        if state.paused.load(Ordering::Acquire) {
            continue;
        }

        match state.task_rx.try_recv() {
            Ok(task) => {
                let description = task.describe();
                if let Some(callback) = &work_callback {
                    callback(true, &description);
                }
                log::info!("{description}");

                if let Err(err) = task.run(&ctx) {
                    log::error!("task [{}] failed: {err:#}", task.tag());
                    if let Some(callback) = &work_callback {
                        callback(false, "paused due to task error");
                    }
                    (state.events)(&WarehouseEvent::Error {
                        title: "Warehouse Update Halted".to_owned(),
                        message: format!("task [{}] failed", task.tag()),
                    });
                    state.paused.store(true, Ordering::Release);
                    continue;
                }

                if task.forces_content_report() {
                    try_enqueue_report(&mut cycles_before_report, true);
                } else {
                    try_enqueue_report(&mut cycles_before_report, false);
                }
            }

            Err(crossbeam_channel::TryRecvError::Empty) => {
                let has_network = state.api.has_auth();

                // hunt for holes to fill: stems first so a riff that becomes
                // resolvable this cycle is handled on the next sweep
                if has_network {
                    if let Some(batch) = find_stem_batch(&state) {
                        if let Some(callback) = &work_callback {
                            callback(true, "finding unpopulated stems...");
                        }
                        bump_change_index_map(&state.change_index, &batch.0);
                        let _ = state
                            .task_tx
                            .send(WarehouseTask::GetStemData { jam: batch.0, stem_ids: batch.1 });
                        try_enqueue_report(&mut cycles_before_report, false);
                        scraping_running = true;
                        continue;
                    }

                    if let Some(batch) = find_riff_batch(&state) {
                        if let Some(callback) = &work_callback {
                            callback(true, "finding unpopulated riffs...");
                        }
                        bump_change_index_map(&state.change_index, &batch.0);
                        let _ = state
                            .task_tx
                            .send(WarehouseTask::GetRiffData { jam: batch.0, riff_ids: batch.1 });
                        try_enqueue_report(&mut cycles_before_report, false);
                        scraping_running = true;
                        continue;
                    }
                }

                // scraping just ran dry: one final report so the UI settles
                if scraping_running {
                    scraping_running = false;
                    try_enqueue_report(&mut cycles_before_report, true);
                }

                if let Some(callback) = &work_callback {
                    callback(false, "no tasks queued");
                }
            }

            Err(crossbeam_channel::TryRecvError::Disconnected) => break,
        }
    }

    log::info!("warehouse worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{apply_jam_snapshot, apply_riff_batch, apply_stem_batch};
    use serde_json::json;

    fn test_warehouse() -> (tempfile::TempDir, Warehouse, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StoragePaths::beneath(dir.path());
        storage.ensure_exists().unwrap();

        let warehouse = Warehouse::new(
            &storage,
            ApiConfig::default(),
            Auth::default(),
            Arc::new(|_| {}),
        )
        .unwrap();

        // second pool onto the same file, for seeding data without the service
        let pool = db::open_pool(&storage.warehouse_db_path()).unwrap();
        (dir, warehouse, pool)
    }

    #[test]
    fn test_snapshot_refused_without_credentials() {
        let (_dir, warehouse, pool) = test_warehouse();
        assert!(!warehouse.has_full_network_access());

        warehouse.add_or_update_jam_snapshot(&JamId::from("band_x"));

        // nothing lands: the request never reached the queue
        std::thread::sleep(std::time::Duration::from_millis(100));
        let conn = pool.get().unwrap();
        assert_eq!(db::riffs::distinct_jam_ids(&conn).unwrap().len(), 0);
    }

    #[test]
    fn test_fetch_single_riff_joins_jam_and_stems() {
        let (_dir, warehouse, pool) = test_warehouse();
        let jam = JamId::from("band_t");

        {
            let mut conn = pool.get().unwrap();
            db::jams::upsert_name(&conn, &jam, "Joined Jam").unwrap();
            apply_jam_snapshot(&mut conn, &jam, &[RiffId::from("r1")]).unwrap();

            let riff_row = serde_json::from_value(json!({
                "key": "r1", "id": "r1",
                "doc": {
                    "_id": "r1",
                    "state": { "bps": 2.0, "barLength": 4.0, "playback": [
                        { "slot": { "current": { "on": true, "currentLoop": "s1", "gain": 1.0 } } }
                    ]},
                    "userName": "tester", "created": 1_650_000_000_000u64,
                    "root": 0, "scale": 0, "app_version": 7
                }
            }))
            .unwrap();
            let check_row = serde_json::from_value(json!({
                "key": "s1", "id": "s1",
                "doc": { "_id": "s1", "type": "Loop", "app_version": 7,
                    "cdn_attachments": { "oggAudio": {
                        "endpoint": "att.example.net", "key": "k", "url": "", "length": 64 } } }
            }))
            .unwrap();
            apply_riff_batch(&mut conn, &jam, &[riff_row], &[check_row], false).unwrap();
        }

        // stem row is still a skeleton: the join works, slot carries the
        // (empty-ish) record rather than failing, since the row exists
        let complete = warehouse.fetch_single_riff(&RiffId::from("r1")).unwrap().unwrap();
        assert_eq!(complete.jam.display_name, "Joined Jam");
        assert!(complete.riff.stems_on[0]);
        assert!(complete.stems[0].is_some());

        // populate the stem and confirm the full data flows through
        {
            let mut conn = pool.get().unwrap();
            let stem_row = serde_json::from_value(json!({
                "key": "s1", "id": "s1",
                "doc": {
                    "_id": "s1",
                    "cdn_attachments": { "oggAudio": {
                        "endpoint": "att.example.net", "key": "k", "url": "", "length": 64 } },
                    "bps": 2.0, "created": 1_650_000_000_000u64, "presetName": "keys",
                    "sampleRate": 48000.0
                }
            }))
            .unwrap();
            apply_stem_batch(&mut conn, &jam, &[stem_row]).unwrap();
        }

        let complete = warehouse.fetch_single_riff(&RiffId::from("r1")).unwrap().unwrap();
        assert_eq!(complete.stems[0].as_ref().unwrap().preset, "keys");

        // unknown riff id resolves to nothing
        assert!(warehouse.fetch_single_riff(&RiffId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_patch_bumps_change_index() {
        let (_dir, warehouse, pool) = test_warehouse();
        let jam = JamId::from("band_t");

        {
            let mut conn = pool.get().unwrap();
            apply_jam_snapshot(&mut conn, &jam, &[RiffId::from("r1")]).unwrap();
        }

        assert!(warehouse.change_index_for_jam(&jam).is_none());
        warehouse
            .patch_riff_stem_record(&jam, &RiffId::from("r1"), 2, &StemId::from("s_new"))
            .unwrap();
        assert_eq!(warehouse.change_index_for_jam(&jam), Some(1));

        // the swapped-in stem now exists as a skeleton for the scraper
        let conn = pool.get().unwrap();
        assert!(db::stems::get_single(&conn, &StemId::from("s_new")).unwrap().is_some());
    }
}

fn find_stem_batch(state: &WorkerState) -> Option<(JamId, Vec<StemId>)> {
    let conn = state.pool.get().ok()?;
    let (jam, _) = db::stems::find_unpopulated(&conn).ok()??;
    let batch = db::stems::find_unpopulated_batch(&conn, &jam, SYNC_BATCH_SIZE).ok()?;
    if batch.is_empty() {
        log::error!("found an empty stem in [{jam}] but the batch query came back empty");
        return None;
    }
    Some((jam, batch))
}

fn find_riff_batch(state: &WorkerState) -> Option<(JamId, Vec<RiffId>)> {
    let conn = state.pool.get().ok()?;
    let (jam, riff) = db::riffs::find_unpopulated(&conn).ok()??;
    let batch = db::riffs::find_unpopulated_batch(&conn, &jam, SYNC_BATCH_SIZE).ok()?;
    if batch.is_empty() {
        let message = format!("found empty riff ({riff}, in jam {jam}) but failed during batch");
        log::error!("riff sync error: {message}");
        (state.events)(&WarehouseEvent::Error {
            title: "Warehouse Riff Sync Error".to_owned(),
            message,
        });
        return None;
    }
    Some((jam, batch))
}
