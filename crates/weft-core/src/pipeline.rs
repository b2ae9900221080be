//! Riff pipeline
//!
//! Serialises riff-load requests onto one worker thread. Requests resolve
//! through a caller-supplied strategy into `RiffComplete` metadata, get
//! turned into live riffs, and come back through an async callback. A small
//! LRU of recently built riffs amortises repeat visits; the only
//! cancellation primitive is draining the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cache::StemCache;
use crate::model::{FetchPolicy, JamId, RiffComplete, RiffFingerprint, RiffId};
use crate::riff::{LiveRiff, RiffHandle};
use crate::stem::AnalysisParams;

/// One riff-load request; the permutation rides through untouched for
/// callers that schedule playback variations.
#[derive(Debug, Clone)]
pub struct RiffRequest {
    pub jam_id: JamId,
    pub riff_id: RiffId,
    /// Preferred display name, used by shared-riff resolution
    pub custom_name: Option<String>,
    pub permutation: Option<u32>,
}

impl RiffRequest {
    pub fn new(jam_id: JamId, riff_id: RiffId) -> Self {
        Self { jam_id, riff_id, custom_name: None, permutation: None }
    }
}

/// Resolves a request into full riff metadata; `None` reports failure.
pub type RiffResolver = Box<dyn Fn(&RiffRequest) -> Option<RiffComplete> + Send>;

/// Delivery callback: the original request, the loaded riff (or `None` when
/// resolution failed or the request was drained) and the permutation.
pub type RiffLoadCallback = Box<dyn FnMut(&RiffRequest, Option<&RiffHandle>) + Send>;

pub type QueueClearedCallback = Box<dyn FnMut() + Send>;

/// Fixed-capacity LRU of live riffs keyed by riff fingerprint. Linear scan
/// with per-entry ages; plenty for the single-digit sizes used here.
struct RiffLru {
    entries: Vec<Option<RiffHandle>>,
    ages: Vec<u32>,
    used: usize,
}

impl RiffLru {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            ages: vec![0; capacity],
            used: 0,
        }
    }

    fn search(&mut self, fingerprint: RiffFingerprint) -> Option<RiffHandle> {
        let mut found = None;
        for idx in 0..self.used {
            let entry = self.entries[idx].as_ref().expect("used entries are populated");
            if found.is_none() && entry.fingerprint() == fingerprint {
                self.ages[idx] = 0;
                found = Some(entry.clone());
            } else {
                self.ages[idx] += 1;
            }
        }
        found
    }

    fn store(&mut self, riff: RiffHandle) {
        if self.used < self.entries.len() {
            for idx in 0..self.used {
                self.ages[idx] += 1;
            }
            self.entries[self.used] = Some(riff);
            self.ages[self.used] = 0;
            self.used += 1;
            return;
        }

        let mut oldest_idx = 0;
        let mut oldest_age = 0;
        for idx in 0..self.entries.len() {
            if self.ages[idx] >= oldest_age {
                oldest_age = self.ages[idx];
                oldest_idx = idx;
            }
            self.ages[idx] += 1;
        }
        self.entries[oldest_idx] = Some(riff);
        self.ages[oldest_idx] = 0;
    }
}

pub struct RiffPipeline {
    requests: crossbeam_channel::Sender<RiffRequest>,
    clear_requested: Arc<AtomicBool>,
    run: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RiffPipeline {
    /// Spawn the pipeline worker. `lru_capacity` bounds how many live riffs
    /// are kept warm for re-requests (typically 4..16).
    pub fn new(
        stem_cache: Arc<StemCache>,
        fetch_policy: FetchPolicy,
        analysis_params: AnalysisParams,
        lru_capacity: usize,
        resolver: RiffResolver,
        mut on_load: RiffLoadCallback,
        mut on_queue_cleared: Option<QueueClearedCallback>,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<RiffRequest>();
        let clear_requested = Arc::new(AtomicBool::new(false));
        let run = Arc::new(AtomicBool::new(true));

        let thread_clear = clear_requested.clone();
        let thread_run = run.clone();

        let worker = std::thread::Builder::new()
            .name("weft-riff-pipeline".to_string())
            .spawn(move || {
                let mut lru = RiffLru::new(lru_capacity);

                log::info!("riff pipeline thread started (lru capacity {lru_capacity})");

                while thread_run.load(Ordering::Acquire) {
                    // short tick so shutdown and clear requests stay responsive
                    let received = rx.recv_timeout(Duration::from_millis(100));

                    if thread_clear.swap(false, Ordering::AcqRel) {
                        // drained requests still report back, with a null
                        // riff, so caller-side backpressure accounting holds
                        if let Ok(request) = &received {
                            on_load(request, None);
                        }
                        while let Ok(request) = rx.try_recv() {
                            on_load(&request, None);
                        }
                        if let Some(cb) = on_queue_cleared.as_mut() {
                            cb();
                        }
                        continue;
                    }

                    let Ok(request) = received else { continue };

                    let fingerprint = RiffFingerprint::of(&request.riff_id);
                    let mut riff = lru.search(fingerprint);

                    if riff.is_none() {
                        match resolver(&request) {
                            Some(complete) => {
                                let mut live = LiveRiff::new(complete);
                                live.fetch(&stem_cache, &fetch_policy, &analysis_params);
                                let handle = live.into_handle();
                                lru.store(handle.clone());
                                riff = Some(handle);
                            }
                            None => {
                                log::error!(
                                    "riff pipeline resolver failed for [{}]",
                                    request.riff_id
                                );
                            }
                        }
                    }

                    on_load(&request, riff.as_ref());
                }

                log::info!("riff pipeline thread exiting");
            })
            .expect("failed to spawn riff pipeline thread");

        Self {
            requests: tx,
            clear_requested,
            run,
            worker: Some(worker),
        }
    }

    /// Queue a riff for loading; delivery is asynchronous via the callback.
    pub fn request_riff(&self, request: RiffRequest) {
        if self.requests.send(request).is_err() {
            log::error!("riff pipeline worker is gone, request dropped");
        }
    }

    /// Drop everything still pending. In-flight loads are not interrupted;
    /// each drained request is reported with a null riff.
    pub fn request_clear(&self) {
        self.clear_requested.store(true, Ordering::Release);
    }
}

impl Drop for RiffPipeline {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JamInfo, RiffRecord};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn resolved(riff_id: &RiffId) -> RiffComplete {
        RiffComplete {
            jam: JamInfo { id: JamId::from("band_t"), display_name: "t".into() },
            riff: RiffRecord {
                id: riff_id.clone(),
                jam_id: JamId::from("band_t"),
                bps: 2.0,
                bar_length: 4,
                ..RiffRecord::default()
            },
            stems: Default::default(),
        }
    }

    fn wait_for(count: &Arc<AtomicUsize>, target: usize) {
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= target {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("timed out waiting for {target} deliveries");
    }

    fn test_pipeline(
        lru_capacity: usize,
    ) -> (RiffPipeline, Arc<AtomicUsize>, Arc<AtomicUsize>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(StemCache::initialise(dir.path(), 48_000).unwrap());

        let resolve_count = Arc::new(AtomicUsize::new(0));
        let deliver_count = Arc::new(AtomicUsize::new(0));

        let resolver_hits = resolve_count.clone();
        let resolver: RiffResolver = Box::new(move |request| {
            resolver_hits.fetch_add(1, Ordering::SeqCst);
            Some(resolved(&request.riff_id))
        });

        let delivered = deliver_count.clone();
        let on_load: RiffLoadCallback = Box::new(move |_request, _riff| {
            delivered.fetch_add(1, Ordering::SeqCst);
        });

        let pipeline = RiffPipeline::new(
            cache,
            FetchPolicy::default(),
            AnalysisParams::default(),
            lru_capacity,
            resolver,
            on_load,
            None,
        );

        (pipeline, resolve_count, deliver_count, dir)
    }

    #[test]
    fn test_lru_hit_skips_resolver() {
        let (pipeline, resolves, delivers, _dir) = test_pipeline(4);

        for id in ["r1", "r2", "r3", "r4", "r1"] {
            pipeline.request_riff(RiffRequest::new(JamId::from("band_t"), RiffId::from(id)));
        }

        wait_for(&delivers, 5);
        // the repeat visit to r1 is served from the LRU
        assert_eq!(resolves.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let (pipeline, resolves, delivers, _dir) = test_pipeline(2);

        // r1 evicted by the time it is re-requested: capacity 2, r2+r3 newer
        for id in ["r1", "r2", "r3", "r1"] {
            pipeline.request_riff(RiffRequest::new(JamId::from("band_t"), RiffId::from(id)));
        }

        wait_for(&delivers, 4);
        assert_eq!(resolves.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_requests_deliver_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(StemCache::initialise(dir.path(), 48_000).unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(AtomicUsize::new(0));

        let resolver: RiffResolver = Box::new(|request| Some(resolved(&request.riff_id)));

        let order_sink = order.clone();
        let deliver_sink = delivered.clone();
        let on_load: RiffLoadCallback = Box::new(move |request, riff| {
            order_sink.lock().unwrap().push(request.riff_id.clone());
            assert!(riff.is_some());
            deliver_sink.fetch_add(1, Ordering::SeqCst);
        });

        let pipeline = RiffPipeline::new(
            cache,
            FetchPolicy::default(),
            AnalysisParams::default(),
            4,
            resolver,
            on_load,
            None,
        );

        let ids = ["ra", "rb", "ra", "rc"];
        for id in ids {
            pipeline.request_riff(RiffRequest::new(JamId::from("band_t"), RiffId::from(id)));
        }

        wait_for(&delivered, 4);
        let seen = order.lock().unwrap();
        assert_eq!(seen.iter().map(RiffId::as_str).collect::<Vec<_>>(), ids);
        drop(seen);
        drop(pipeline);
    }

    #[test]
    fn test_clear_reports_null_riffs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(StemCache::initialise(dir.path(), 48_000).unwrap());

        let nulls = Arc::new(AtomicUsize::new(0));
        let cleared = Arc::new(AtomicUsize::new(0));

        // a resolver slow enough that queued requests pile up behind it
        let resolver: RiffResolver = Box::new(|request| {
            std::thread::sleep(Duration::from_millis(150));
            Some(resolved(&request.riff_id))
        });

        let null_sink = nulls.clone();
        let on_load: RiffLoadCallback = Box::new(move |_request, riff| {
            if riff.is_none() {
                null_sink.fetch_add(1, Ordering::SeqCst);
            }
        });

        let cleared_sink = cleared.clone();
        let on_cleared: QueueClearedCallback = Box::new(move || {
            cleared_sink.fetch_add(1, Ordering::SeqCst);
        });

        let pipeline = RiffPipeline::new(
            cache,
            FetchPolicy::default(),
            AnalysisParams::default(),
            4,
            resolver,
            on_load,
            Some(on_cleared),
        );

        for id in ["r1", "r2", "r3"] {
            pipeline.request_riff(RiffRequest::new(JamId::from("band_t"), RiffId::from(id)));
        }
        pipeline.request_clear();

        wait_for(&cleared, 1);
        // at least the requests still queued at clear time came back null
        assert!(nulls.load(Ordering::SeqCst) >= 1);
    }
}
