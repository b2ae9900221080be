//! Live riff
//!
//! Turns a fully resolved `RiffComplete` into a playable object: shared
//! handles to up to eight live stems, derived loop timing, and the analysis
//! work scheduled behind a completion gate. Riffs are passed to the mixer as
//! `basedrop::Shared` handles so the audio thread can drop them freely.

use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;

use crate::cache::{StemCache, StemHandle};
use crate::gc;
use crate::model::{
    FetchPolicy, RiffComplete, RiffFingerprint, ROOT_NAMES, SCALE_NAMES,
};
use crate::stem::{AnalysisParams, LiveStem, StemState};
use crate::types::STEM_SLOTS;

/// Shared riff handle; dropping one on the audio thread defers the actual
/// free to the GC thread.
pub type RiffHandle = basedrop::Shared<LiveRiff>;

/// Counts outstanding tasks in a spawned work graph; `wait_idle` blocks until
/// every task has called `done`.
pub struct TaskGate {
    remaining: Mutex<usize>,
    signal: Condvar,
}

impl TaskGate {
    pub fn new(task_count: usize) -> Self {
        Self {
            remaining: Mutex::new(task_count),
            signal: Condvar::new(),
        }
    }

    pub fn done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.signal.notify_all();
        }
    }

    pub fn wait_idle(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.signal.wait(remaining).unwrap();
        }
    }
}

/// Loop timing derived on load. Lengths can grow past the initial estimate
/// when a stem from a slower tempo gets time-stretched in.
#[derive(Debug, Clone, Default)]
pub struct RiffTiming {
    pub sample_rate: u32,
    /// Quarter-beats per bar (bar_length / 4)
    pub quarter_beats: i32,
    pub bps: f32,
    pub bpm: f32,
    pub length_in_sec_per_bar: f64,
    pub length_in_sec: f64,
    pub length_in_samples: u64,
    pub samples_per_bar: u64,
    pub bar_count: i32,
    pub longest_stem_in_bars: i32,
}

/// Playback progression snapshot for UI readouts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progression {
    pub percentage: f64,
    pub bar: i32,
    pub bar_segment: i32,
}

impl RiffTiming {
    /// Where a wrapped playback sample sits inside the riff.
    pub fn progression_at(&self, playback_sample: u64) -> Progression {
        if self.length_in_samples == 0 || self.samples_per_bar == 0 {
            return Progression::default();
        }
        let wrapped = playback_sample % self.length_in_samples;
        let bar = (wrapped / self.samples_per_bar) as i32;
        let within_bar = wrapped % self.samples_per_bar;
        let segment =
            (within_bar * self.quarter_beats.max(1) as u64 / self.samples_per_bar) as i32;
        Progression {
            percentage: wrapped as f64 / self.length_in_samples as f64,
            bar: bar.min(self.bar_count.saturating_sub(1)),
            bar_segment: segment,
        }
    }
}

/// The longest a single loop may run; the upstream looper disables rows at
/// slow tempos and long bars to stay under this, and load-time timing has to
/// mirror that to line up with what was recorded.
const MAX_LOOP_SECONDS: f64 = 60.0;

/// Initial timing estimate from riff-level tempo and bar length alone.
pub(crate) fn compute_initial_timing(
    bps: f32,
    bar_length: i32,
    sample_rate: u32,
) -> RiffTiming {
    let quarter_beats = (bar_length / 4).max(1);

    // malformed upstream rows can carry a zero tempo; an empty timing keeps
    // the riff inert instead of wedging the halving loop below
    if !(bps > 0.0) {
        return RiffTiming { sample_rate, quarter_beats, ..RiffTiming::default() };
    }

    let length_in_sec_per_bar = (1.0 / f64::from(bps)) * f64::from(quarter_beats);

    // start from 8 looper segments and halve until the loop fits under the
    // hard cap, tracking how many segments survive
    let mut segments = 8.0f64;
    let mut length_in_sec = MAX_LOOP_SECONDS;
    while length_in_sec >= MAX_LOOP_SECONDS {
        length_in_sec = length_in_sec_per_bar * segments;
        segments *= 0.5;
    }
    let bar_count = (segments * 2.0) as i32;

    let length_in_samples = (length_in_sec * f64::from(sample_rate)) as u64;

    RiffTiming {
        sample_rate,
        quarter_beats,
        bps,
        bpm: bps * 60.0,
        length_in_sec_per_bar,
        length_in_sec,
        length_in_samples,
        samples_per_bar: if bar_count > 0 { length_in_samples / bar_count as u64 } else { 0 },
        bar_count,
        longest_stem_in_bars: 1,
    }
}

/// Writer handed one stem's rendered loop during export.
pub trait StemWriter {
    fn append(&mut self, left: &[f32], right: &[f32]) -> std::io::Result<()>;
}

/// Picks (or declines) a writer per stem slot; `None` means dry-run.
pub type StemWriterFactory<'a> =
    dyn FnMut(usize, &LiveStem) -> Option<Box<dyn StemWriter>> + 'a;

/// WAV-backed stem writer for export pipelines.
pub struct WavStemWriter {
    writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
}

impl WavStemWriter {
    pub fn create(path: &std::path::Path, sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        Ok(Self { writer: hound::WavWriter::create(path, spec)? })
    }

    pub fn finalize(self) -> Result<(), hound::Error> {
        self.writer.finalize()
    }
}

impl StemWriter for WavStemWriter {
    fn append(&mut self, left: &[f32], right: &[f32]) -> std::io::Result<()> {
        for (l, r) in left.iter().zip(right.iter()) {
            self.writer
                .write_sample(*l)
                .and_then(|_| self.writer.write_sample(*r))
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct StemReportEntry {
    slot: usize,
    id: String,
    user: String,
    preset: String,
    bps: f32,
    gain: f32,
    time_scale: f32,
    repetitions: i32,
    sample_count: usize,
    failed: bool,
}

#[derive(Serialize)]
struct RiffReport {
    riff_id: String,
    jam_id: String,
    jam_name: String,
    user: String,
    bpm: f32,
    root: String,
    scale: String,
    bar_count: i32,
    length_in_sec: f64,
    length_in_samples: u64,
    stems: Vec<StemReportEntry>,
}

pub struct LiveRiff {
    data: RiffComplete,
    fingerprint: RiffFingerprint,
    timing: RiffTiming,
    stems: [Option<StemHandle>; STEM_SLOTS],
    gains: [f32; STEM_SLOTS],
    time_scales: [f32; STEM_SLOTS],
    stem_samples: [u64; STEM_SLOTS],
    stem_seconds: [f64; STEM_SLOTS],
    repetitions: [i32; STEM_SLOTS],
    analysis_gate: Option<Arc<TaskGate>>,
    jam_name_upper: String,
    ui_details: String,
}

impl LiveRiff {
    pub fn new(data: RiffComplete) -> Self {
        let fingerprint = RiffFingerprint::of(&data.riff.id);
        let jam_name_upper = data.jam.display_name.to_uppercase();

        log::debug!("riff allocated [{}] fp {:#x}", data.riff.id, fingerprint.0);

        Self {
            data,
            fingerprint,
            timing: RiffTiming::default(),
            stems: Default::default(),
            gains: [0.0; STEM_SLOTS],
            time_scales: [0.0; STEM_SLOTS],
            stem_samples: [0; STEM_SLOTS],
            stem_seconds: [0.0; STEM_SLOTS],
            repetitions: [0; STEM_SLOTS],
            analysis_gate: None,
            jam_name_upper,
            ui_details: String::new(),
        }
    }

    /// Resolve all stems through the cache, fetch missing audio in parallel,
    /// then derive the final loop timing. Analysis is scheduled after fetch
    /// and does not block the return; `wait_for_analysis` joins it.
    pub fn fetch(&mut self, cache: &StemCache, policy: &FetchPolicy, analysis: &AnalysisParams) {
        self.timing = compute_initial_timing(
            self.data.riff.bps,
            self.data.riff.bar_length,
            cache.target_sample_rate(),
        );

        log::debug!(
            "riff [{}] {:.2} BPM, {} / 4, initially {:.3}s, {} bars",
            self.data.riff.id,
            self.timing.bpm,
            self.timing.quarter_beats,
            self.timing.length_in_sec,
            self.timing.bar_count
        );

        let mut to_load: Vec<(StemHandle, std::path::PathBuf)> = Vec::new();

        for slot in 0..STEM_SLOTS {
            if !self.data.riff.stems_on[slot] {
                continue;
            }
            let Some(record) = &self.data.stems[slot] else {
                continue;
            };

            let handle = cache.request(record);
            if handle.state() == StemState::Empty {
                to_load.push((handle.clone(), cache.cache_path_for(record)));
            }

            // stems get reused across riffs at different tempos; scale each
            // one's playback rate to this riff's tempo
            self.time_scales[slot] = self.data.riff.bps / record.bps.max(f32::MIN_POSITIVE);
            self.gains[slot] = self.data.riff.gains[slot];
            self.stems[slot] = Some(handle);
        }

        // fan the blocking fetches out across the worker pool and wait
        rayon::scope(|scope| {
            for (stem, cache_dir) in &to_load {
                scope.spawn(move |_| {
                    stem.fetch(policy, cache_dir);
                });
            }
        });

        // analysis rides behind the fetch and may outlive this call; the gate
        // plus each task's own stem handle keep the PCM alive meanwhile
        if !to_load.is_empty() {
            let gate = Arc::new(TaskGate::new(to_load.len()));
            let params = analysis.clone();
            for (stem, _) in to_load {
                stem.keep_gate(gate.clone());
                let task_gate = gate.clone();
                let task_params = params.clone();
                rayon::spawn(move || {
                    stem.analyse(&task_params);
                    task_gate.done();
                });
            }
            self.analysis_gate = Some(gate);
        }

        self.finalise_timing();

        self.ui_details = format!(
            "{} | {} {} | {:.1} BPM | {} / 4",
            self.data.riff.user,
            ROOT_NAMES.get(self.data.riff.root as usize).copied().unwrap_or("?"),
            SCALE_NAMES.get(self.data.riff.scale as usize).copied().unwrap_or("?"),
            self.timing.bpm,
            self.timing.quarter_beats,
        );
    }

    /// With stems loaded, stretch the riff to fit the longest time-scaled
    /// stem and work out per-stem repetition counts.
    fn finalise_timing(&mut self) {
        let sample_rate = f64::from(self.timing.sample_rate.max(1));

        for slot in 0..STEM_SLOTS {
            let Some(stem) = &self.stems[slot] else { continue };
            let raw_samples = stem.sample_count();
            if raw_samples == 0 {
                continue;
            }

            let scale = f64::from(self.time_scales[slot]);
            let scaled_samples = (raw_samples as f64 * (1.0 / scale)) as u64;
            let scaled_seconds = scaled_samples as f64 / sample_rate;

            self.stem_samples[slot] = scaled_samples;
            self.stem_seconds[slot] = scaled_seconds;

            // a stem recorded against a longer bar setting pushes the riff out
            self.timing.length_in_sec = self.timing.length_in_sec.max(scaled_seconds);
            self.timing.length_in_samples = self.timing.length_in_samples.max(scaled_samples);
        }

        if self.timing.length_in_sec_per_bar > 0.0 {
            self.timing.bar_count =
                (self.timing.length_in_sec / self.timing.length_in_sec_per_bar) as i32;
        }
        if self.timing.bar_count > 0 {
            self.timing.samples_per_bar =
                self.timing.length_in_samples / self.timing.bar_count as u64;
        }

        for slot in 0..STEM_SLOTS {
            let Some(stem) = &self.stems[slot] else { continue };
            if stem.has_failed() || self.stem_samples[slot] == 0 {
                continue;
            }

            let mut repeats = (self.timing.length_in_samples as f64
                / self.stem_samples[slot] as f64)
                .round() as i32;
            if repeats <= 0 {
                log::warn!(
                    "riff [{}] stem slot {slot} computed {repeats} repeats, clamping to 1",
                    self.data.riff.id
                );
                repeats = 1;
            }
            self.repetitions[slot] = repeats;

            self.timing.longest_stem_in_bars = self
                .timing
                .longest_stem_in_bars
                .max(self.timing.bar_count / repeats);
        }

        log::debug!(
            "riff [{}] final timing: {:.3}s, {} bars, {} samples",
            self.data.riff.id,
            self.timing.length_in_sec,
            self.timing.bar_count,
            self.timing.length_in_samples
        );
    }

    /// Wrap into a shared handle for hand-off to the mixer / LRU / UI.
    pub fn into_handle(self) -> RiffHandle {
        basedrop::Shared::new(&gc::gc_handle(), self)
    }

    #[inline]
    pub fn data(&self) -> &RiffComplete {
        &self.data
    }

    #[inline]
    pub fn fingerprint(&self) -> RiffFingerprint {
        self.fingerprint
    }

    #[inline]
    pub fn timing(&self) -> &RiffTiming {
        &self.timing
    }

    #[inline]
    pub fn stem(&self, slot: usize) -> Option<&StemHandle> {
        self.stems.get(slot).and_then(Option::as_ref)
    }

    #[inline]
    pub fn gain(&self, slot: usize) -> f32 {
        self.gains[slot]
    }

    #[inline]
    pub fn time_scale(&self, slot: usize) -> f32 {
        self.time_scales[slot]
    }

    #[inline]
    pub fn repetitions(&self, slot: usize) -> i32 {
        self.repetitions[slot]
    }

    pub fn jam_name_upper(&self) -> &str {
        &self.jam_name_upper
    }

    pub fn ui_details(&self) -> &str {
        &self.ui_details
    }

    /// Block until all analysis scheduled by `fetch` has completed.
    pub fn wait_for_analysis(&self) {
        if let Some(gate) = &self.analysis_gate {
            gate.wait_idle();
        }
    }

    /// Render each active stem as one time-scaled loop (with gain applied and
    /// an optional wrapped sample offset) and hand it to the writer the
    /// factory produces for that slot. Not for the real-time path.
    pub fn export_to_disk(
        &self,
        writer_for_stem: &mut StemWriterFactory<'_>,
        sample_offset: i64,
    ) -> std::io::Result<()> {
        for slot in 0..STEM_SLOTS {
            let Some(stem) = &self.stems[slot] else { continue };
            let gain = self.gains[slot];
            if stem.has_failed() || gain <= 0.0 {
                continue;
            }
            let Some(pcm) = stem.pcm() else { continue };

            let Some(mut writer) = writer_for_stem(slot, stem.as_ref()) else {
                continue; // dry-run for this slot
            };

            let scale = f64::from(self.time_scales[slot]);
            let raw_count = pcm.sample_count() as i64;
            let scaled_count = (raw_count as f64 / scale) as i64;
            let offset_scaled = (sample_offset as f64 * scale) as i64;

            let mut left = vec![0.0f32; scaled_count as usize];
            let mut right = vec![0.0f32; scaled_count as usize];

            for write in 0..scaled_count {
                let read = ((write as f64 * scale) as i64 + offset_scaled).rem_euclid(raw_count);
                left[write as usize] = pcm.left[read as usize] * gain;
                right[write as usize] = pcm.right[read as usize] * gain;
            }

            writer.append(&left, &right)?;
        }
        Ok(())
    }

    /// Human-readable JSON dump of the riff and its stems, for export
    /// pipelines and diagnostics.
    pub fn metadata_report(&self) -> String {
        let stems = (0..STEM_SLOTS)
            .filter_map(|slot| {
                let stem = self.stems[slot].as_ref()?;
                let record = stem.record();
                Some(StemReportEntry {
                    slot,
                    id: record.id.to_string(),
                    user: record.user.clone(),
                    preset: record.preset.clone(),
                    bps: record.bps,
                    gain: self.gains[slot],
                    time_scale: self.time_scales[slot],
                    repetitions: self.repetitions[slot],
                    sample_count: stem.sample_count(),
                    failed: stem.has_failed(),
                })
            })
            .collect();

        let report = RiffReport {
            riff_id: self.data.riff.id.to_string(),
            jam_id: self.data.jam.id.to_string(),
            jam_name: self.data.jam.display_name.clone(),
            user: self.data.riff.user.clone(),
            bpm: self.timing.bpm,
            root: ROOT_NAMES
                .get(self.data.riff.root as usize)
                .copied()
                .unwrap_or("?")
                .to_owned(),
            scale: SCALE_NAMES
                .get(self.data.riff.scale as usize)
                .copied()
                .unwrap_or("?")
                .to_owned(),
            bar_count: self.timing.bar_count,
            length_in_sec: self.timing.length_in_sec,
            length_in_samples: self.timing.length_in_samples,
            stems,
        };

        serde_json::to_string_pretty(&report).unwrap_or_else(|err| err.to_string())
    }

    /// Attach pre-built stems and run timing finalisation without touching
    /// the network. Test support for the mixer and export suites.
    #[cfg(test)]
    pub(crate) fn with_test_stems(
        data: RiffComplete,
        sample_rate: u32,
        stems: Vec<(usize, StemHandle)>,
    ) -> Self {
        let mut riff = Self::new(data);
        riff.timing =
            compute_initial_timing(riff.data.riff.bps, riff.data.riff.bar_length, sample_rate);
        for (slot, stem) in stems {
            riff.time_scales[slot] = riff.data.riff.bps / stem.record().bps.max(f32::MIN_POSITIVE);
            riff.gains[slot] = riff.data.riff.gains[slot];
            riff.stems[slot] = Some(stem);
        }
        riff.finalise_timing();
        riff
    }
}

impl Drop for LiveRiff {
    fn drop(&mut self) {
        log::debug!("riff released [{}] fp {:#x}", self.data.riff.id, self.fingerprint.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JamId, JamInfo, RiffId, RiffRecord, StemId, StemRecord};

    fn riff_complete(bps: f32, bar_length: i32) -> RiffComplete {
        let mut riff = RiffRecord {
            id: RiffId::from("riff_t"),
            jam_id: JamId::from("band_t"),
            bps,
            bpm_rnd: bps * 60.0,
            bar_length,
            gains: [1.0; STEM_SLOTS],
            ..RiffRecord::default()
        };
        riff.sync_active_flags();
        RiffComplete {
            jam: JamInfo { id: JamId::from("band_t"), display_name: "Test Jam".into() },
            riff,
            stems: Default::default(),
        }
    }

    fn stem_with_samples(id: &str, bps: f32, samples: usize) -> StemHandle {
        let record = StemRecord { id: StemId::from(id), bps, ..StemRecord::default() };
        std::sync::Arc::new(LiveStem::from_test_pcm(
            record,
            48_000,
            vec![0.25; samples],
            vec![0.25; samples],
        ))
    }

    #[test]
    fn test_timing_standard_riff() {
        // 120 BPM, 4/4: half-second bars, 8 looper segments alive
        let timing = compute_initial_timing(2.0, 4, 48_000);
        assert_eq!(timing.quarter_beats, 1);
        assert_eq!(timing.bar_count, 8);
        assert!((timing.length_in_sec - 4.0).abs() < 1e-9);
        assert_eq!(timing.length_in_samples, 4 * 48_000);
    }

    #[test]
    fn test_timing_halves_until_under_cap() {
        // 25 BPM at 16/4 would be 9.6s bars * 8 = 76.8s; halved once to 4 bars
        let timing = compute_initial_timing(25.0 / 60.0, 16, 48_000);
        assert_eq!(timing.bar_count, 4);
        assert!(timing.length_in_sec < 60.0);
        assert!((timing.length_in_sec - 38.4).abs() < 1e-6);
    }

    #[test]
    fn test_length_lower_bound_holds() {
        // length >= bars * per-bar length for a spread of configurations
        for (bps, bar_length) in [(2.0, 4), (1.5, 8), (25.0 / 60.0, 16), (3.2, 4)] {
            let timing = compute_initial_timing(bps, bar_length, 48_000);
            assert!(
                timing.length_in_sec
                    >= timing.length_in_sec_per_bar * f64::from(timing.bar_count) - 1e-9,
                "violated for bps={bps} bar_length={bar_length}"
            );
            assert!(timing.length_in_sec < 60.0 + 1e-9);
        }
    }

    #[test]
    fn test_slow_stem_extends_riff() {
        let mut data = riff_complete(2.0, 4);
        data.riff.stems[0] = StemId::from("stem_a");
        data.riff.stems[1] = StemId::from("stem_b");
        data.riff.sync_active_flags();

        // stem_b was recorded at half tempo: time scale 2.0, so its 8s of
        // audio spans 4s here — exactly the riff length, 1 repetition
        let riff = LiveRiff::with_test_stems(
            data,
            48_000,
            vec![
                (0, stem_with_samples("stem_a", 2.0, 48_000)),
                (1, stem_with_samples("stem_b", 1.0, 8 * 48_000)),
            ],
        );

        let timing = riff.timing();
        assert_eq!(timing.length_in_samples, 4 * 48_000);
        // stem_a: one second of audio, repeated 4 times over the riff
        assert_eq!(riff.repetitions(0), 4);
        assert_eq!(riff.repetitions(1), 1);
        assert_eq!(timing.longest_stem_in_bars, 8);
    }

    #[test]
    fn test_export_applies_gain_and_offset() {
        let mut data = riff_complete(2.0, 4);
        data.riff.stems[0] = StemId::from("stem_a");
        data.riff.gains[0] = 0.5;
        data.riff.sync_active_flags();

        let stem = {
            let record = StemRecord { id: StemId::from("stem_a"), bps: 2.0, ..StemRecord::default() };
            let left: Vec<f32> = (0..1000).map(|i| i as f32).collect();
            let right = left.clone();
            std::sync::Arc::new(LiveStem::from_test_pcm(record, 48_000, left, right))
        };

        let riff = LiveRiff::with_test_stems(data, 48_000, vec![(0, stem)]);

        let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut factory = move |_slot: usize, _stem: &LiveStem| -> Option<Box<dyn StemWriter>> {
            struct Fwd(std::sync::Arc<std::sync::Mutex<Vec<f32>>>);
            impl StemWriter for Fwd {
                fn append(&mut self, left: &[f32], _right: &[f32]) -> std::io::Result<()> {
                    self.0.lock().unwrap().extend_from_slice(left);
                    Ok(())
                }
            }
            Some(Box::new(Fwd(sink.clone())))
        };

        riff.export_to_disk(&mut factory, 10).unwrap();

        let samples = captured.lock().unwrap();
        assert_eq!(samples.len(), 1000);
        // offset 10 with gain 0.5: first written sample reads source[10]
        assert_eq!(samples[0], 10.0 * 0.5);
        // wraps around the loop end
        assert_eq!(samples[995], ((995 + 10) % 1000) as f32 * 0.5);
    }

    #[test]
    fn test_metadata_report_is_valid_json() {
        let mut data = riff_complete(2.0, 4);
        data.riff.stems[0] = StemId::from("stem_a");
        data.riff.sync_active_flags();
        let riff = LiveRiff::with_test_stems(
            data,
            48_000,
            vec![(0, stem_with_samples("stem_a", 2.0, 48_000))],
        );
        let report = riff.metadata_report();
        let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(parsed["riff_id"], "riff_t");
        assert_eq!(parsed["stems"].as_array().unwrap().len(), 1);
    }
}
