//! Preview mixer
//!
//! Single-threaded, block-based mixing of the current live riff into a
//! stereo output buffer. All mutable state lives on the audio-callback side;
//! the controller half only touches the SPSC queue and a handful of shared
//! atomics. Riff swaps happen instantly or locked to bar boundaries, always
//! smoothed with a short precomputed crossfade so transitions never click.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::riff::{Progression, RiffHandle};
use crate::types::{Sample, StereoBuffer, STEM_SLOTS};

/// Length of the transition blend curve, in samples
const BLEND_LEN: usize = 128;

/// How many bars (or bar fractions) a bar-locked transition waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSpan {
    Eighth,
    Quarter,
    Half,
    Once,
    /// Wait a multiple of whole bars; the factor lives alongside in the config
    Many,
}

impl TransitionSpan {
    fn to_u8(self) -> u8 {
        match self {
            TransitionSpan::Eighth => 0,
            TransitionSpan::Quarter => 1,
            TransitionSpan::Half => 2,
            TransitionSpan::Once => 3,
            TransitionSpan::Many => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransitionSpan::Eighth,
            1 => TransitionSpan::Quarter,
            2 => TransitionSpan::Half,
            4 => TransitionSpan::Many,
            _ => TransitionSpan::Once,
        }
    }
}

/// Transition behaviour, shared between controller and audio callback.
struct TransitionConfig {
    lock_to_bar: AtomicBool,
    on_beat: AtomicU32,
    span: AtomicU8,
    bar_multiple: AtomicU32,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            lock_to_bar: AtomicBool::new(false),
            on_beat: AtomicU32::new(0),
            span: AtomicU8::new(TransitionSpan::Once.to_u8()),
            bar_multiple: AtomicU32::new(2),
        }
    }
}

/// Playback progression published by the audio callback for UI readouts.
pub struct PlaybackStatus {
    percentage_bits: AtomicU64,
    bar: AtomicI32,
    bar_segment: AtomicI32,
    transitioned: AtomicBool,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            percentage_bits: AtomicU64::new(0),
            bar: AtomicI32::new(0),
            bar_segment: AtomicI32::new(0),
            transitioned: AtomicBool::new(false),
        }
    }
}

impl PlaybackStatus {
    pub fn percentage(&self) -> f64 {
        f64::from_bits(self.percentage_bits.load(Ordering::Relaxed))
    }

    pub fn bar(&self) -> i32 {
        self.bar.load(Ordering::Relaxed)
    }

    pub fn bar_segment(&self) -> i32 {
        self.bar_segment.load(Ordering::Relaxed)
    }

    /// True once after each riff swap in the mix; reading clears the pulse.
    pub fn take_transition_pulse(&self) -> bool {
        self.transitioned.swap(false, Ordering::Relaxed)
    }

    fn publish(&self, progression: Progression) {
        self.percentage_bits
            .store(progression.percentage.to_bits(), Ordering::Relaxed);
        self.bar.store(progression.bar, Ordering::Relaxed);
        self.bar_segment.store(progression.bar_segment, Ordering::Relaxed);
    }
}

/// Called from the audio callback whenever the playing riff changes;
/// `None` means playback stopped.
pub type RiffChangeCallback = Box<dyn FnMut(Option<&RiffHandle>) + Send>;

/// Control-side handle: submit riffs, request drains, tune transitions.
pub struct PreviewController {
    queue: rtrb::Producer<Option<RiffHandle>>,
    drain: Arc<AtomicBool>,
    config: Arc<TransitionConfig>,
    status: Arc<PlaybackStatus>,
}

impl PreviewController {
    /// Queue a riff for playback. Returns false when the queue is full.
    pub fn enqueue_riff(&mut self, riff: RiffHandle) -> bool {
        self.queue.push(Some(riff)).is_ok()
    }

    /// Stop playback: everything pending is discarded at the next callback
    /// and the mixer falls back to silence.
    pub fn stop(&mut self) {
        let _ = self.queue.push(None);
        self.drain.store(true, Ordering::Release);
    }

    pub fn set_bar_lock(&self, enabled: bool) {
        self.config.lock_to_bar.store(enabled, Ordering::Relaxed);
    }

    /// Quarter-beat offset within the bar that transitions snap to.
    pub fn set_on_beat(&self, beat: u32) {
        self.config.on_beat.store(beat, Ordering::Relaxed);
    }

    pub fn set_span(&self, span: TransitionSpan) {
        self.config.span.store(span.to_u8(), Ordering::Relaxed);
    }

    pub fn set_bar_multiple(&self, multiple: u32) {
        self.config.bar_multiple.store(multiple.max(1), Ordering::Relaxed);
    }

    pub fn status(&self) -> &PlaybackStatus {
        &self.status
    }
}

/// Audio-callback side of the preview mixer. Everything here is owned by
/// whichever thread the audio backend calls `render` from; nothing blocks.
pub struct PreviewMixer {
    queue: rtrb::Consumer<Option<RiffHandle>>,
    drain: Arc<AtomicBool>,
    config: Arc<TransitionConfig>,
    status: Arc<PlaybackStatus>,
    on_riff_change: Option<RiffChangeCallback>,

    current: Option<RiffHandle>,
    playback_sample: u64,

    // per-stem scratch, pre-allocated to the maximum block size
    mix_left: [Vec<Sample>; STEM_SLOTS],
    mix_right: [Vec<Sample>; STEM_SLOTS],

    // crossfade state: last rendered sample per stem, the values being
    // blended from, and the precomputed (1 - i/N)^2 decay curve
    blend_cache_left: [Sample; STEM_SLOTS],
    blend_cache_right: [Sample; STEM_SLOTS],
    blend_active_left: [Sample; STEM_SLOTS],
    blend_active_right: [Sample; STEM_SLOTS],
    blend_curve: [Sample; BLEND_LEN],
    blend_remaining: usize,
}

impl PreviewMixer {
    /// Build the mixer pair. `max_block` is the largest sample count a single
    /// `render` call will ever see; `queue_len` bounds pending riff swaps.
    pub fn new(
        max_block: usize,
        queue_len: usize,
        on_riff_change: Option<RiffChangeCallback>,
    ) -> (PreviewMixer, PreviewController) {
        let (producer, consumer) = rtrb::RingBuffer::new(queue_len.max(1));

        let drain = Arc::new(AtomicBool::new(false));
        let config = Arc::new(TransitionConfig::default());
        let status = Arc::new(PlaybackStatus::default());

        let mut blend_curve = [0.0; BLEND_LEN];
        for (i, value) in blend_curve.iter_mut().enumerate() {
            let t = 1.0 - (i as Sample / BLEND_LEN as Sample);
            *value = t * t;
        }

        let mixer = PreviewMixer {
            queue: consumer,
            drain: drain.clone(),
            config: config.clone(),
            status: status.clone(),
            on_riff_change,
            current: None,
            playback_sample: 0,
            mix_left: std::array::from_fn(|_| vec![0.0; max_block]),
            mix_right: std::array::from_fn(|_| vec![0.0; max_block]),
            blend_cache_left: [0.0; STEM_SLOTS],
            blend_cache_right: [0.0; STEM_SLOTS],
            blend_active_left: [0.0; STEM_SLOTS],
            blend_active_right: [0.0; STEM_SLOTS],
            blend_curve,
            blend_remaining: 0,
        };

        let controller = PreviewController { queue: producer, drain, config, status };

        (mixer, controller)
    }

    /// The playing riff's current playback sample; test and UI support.
    pub fn playback_sample(&self) -> u64 {
        self.playback_sample
    }

    /// Mix one block. Called from the audio callback with the output buffer,
    /// the session volume and the backend's absolute sample position.
    pub fn render(&mut self, output: &mut StereoBuffer, output_volume: f32, _sample_position: u64) {
        let samples = output.len();
        debug_assert!(samples <= self.mix_left[0].len());
        if samples == 0 {
            return;
        }

        // drain request: pull everything queued (last one wins), reporting
        // each swap so callers tracking in-flight requests stay balanced
        if self.drain.load(Ordering::Acquire) {
            while let Ok(next) = self.queue.pop() {
                self.current = next;
                self.fire_riff_change();
            }
            self.drain.store(false, Ordering::Release);
        }

        let mut riff_enqueued = self.queue.slots() > 0;
        let riff_empty = self
            .current
            .as_ref()
            .map_or(true, |riff| riff.timing().length_in_samples == 0);

        // nothing playing and nothing queued: emit silence and reset
        if riff_empty && !riff_enqueued {
            output.fill_silence();
            self.blend_cache_left = [0.0; STEM_SLOTS];
            self.blend_cache_right = [0.0; STEM_SLOTS];
            self.status.publish(Progression::default());
            return;
        }

        let mut tx_offset = 0usize;
        let mut tx_limit = samples;

        if riff_enqueued {
            let instant = riff_empty || !self.config.lock_to_bar.load(Ordering::Relaxed);

            if instant {
                self.dequeue_next(&mut riff_enqueued);
                self.arm_blend();
                if self.current.is_some() {
                    self.render_current(0, samples);
                } else {
                    self.write_silence(0, samples);
                }
            } else {
                // bar-locked: work out how far the next segment boundary is
                let timing = self.current.as_ref().expect("riff checked above").timing();
                let quarter_beats = timing.quarter_beats.max(1) as u64;
                let beat_shift = u64::from(self.config.on_beat.load(Ordering::Relaxed))
                    * (timing.samples_per_bar / quarter_beats);

                let mut segment = timing.samples_per_bar.max(1) as i64;
                match TransitionSpan::from_u8(self.config.span.load(Ordering::Relaxed)) {
                    TransitionSpan::Eighth => segment /= 8,
                    TransitionSpan::Quarter => segment /= 4,
                    TransitionSpan::Half => segment /= 2,
                    TransitionSpan::Once => {}
                    TransitionSpan::Many => {
                        segment *= i64::from(self.config.bar_multiple.load(Ordering::Relaxed))
                    }
                }
                let segment = segment.max(1);

                let mut shifted = self.playback_sample as i64 - beat_shift as i64;
                if shifted < 0 {
                    shifted += segment;
                }
                let until_next = (segment - (shifted % segment)) as usize;

                if until_next > samples {
                    self.render_current(0, samples);
                } else {
                    if until_next > 0 {
                        self.render_current(0, until_next);
                    }
                    if riff_enqueued {
                        self.dequeue_next(&mut riff_enqueued);
                    }
                    self.arm_blend();

                    let remainder = samples - until_next;
                    if self.current.is_some() {
                        self.render_current(until_next, remainder);
                    } else {
                        self.write_silence(until_next, remainder);
                    }

                    tx_offset = until_next;
                    tx_limit = remainder;
                }
            }
        } else {
            self.render_current(0, samples);
        }

        self.apply_blend(tx_offset, tx_limit);

        if let Some(riff) = &self.current {
            self.status.publish(riff.timing().progression_at(self.playback_sample));
        }

        self.downmix(output, output_volume, samples);
    }

    fn fire_riff_change(&mut self) {
        self.status.transitioned.store(true, Ordering::Relaxed);
        if let Some(callback) = &mut self.on_riff_change {
            callback(self.current.as_ref());
        }
    }

    fn dequeue_next(&mut self, riff_enqueued: &mut bool) {
        if let Ok(next) = self.queue.pop() {
            self.current = next;
            self.fire_riff_change();
        }
        *riff_enqueued = self.queue.slots() > 0;
    }

    /// Latch the most recent output samples as the blend source.
    fn arm_blend(&mut self) {
        self.blend_active_left = self.blend_cache_left;
        self.blend_active_right = self.blend_cache_right;
        self.blend_remaining = BLEND_LEN;
    }

    /// Render `count` samples of the current riff into the per-stem scratch
    /// starting at `offset`, advancing the riff playback position.
    fn render_current(&mut self, offset: usize, count: usize) {
        if count == 0 {
            return;
        }
        let riff_len = self
            .current
            .as_ref()
            .map_or(0, |riff| riff.timing().length_in_samples);
        if riff_len == 0 {
            self.write_silence(offset, count);
            return;
        }

        while self.playback_sample >= riff_len {
            self.playback_sample -= riff_len;
        }
        let wrapped_start = self.playback_sample;

        let riff = self.current.as_ref().expect("non-empty riff checked above");

        for slot in 0..STEM_SLOTS {
            self.blend_cache_left[slot] = 0.0;
            self.blend_cache_right[slot] = 0.0;

            let stem = match riff.stem(slot) {
                Some(stem) if !stem.has_failed() => stem,
                // any stem problem mixes as silence
                _ => {
                    self.mix_left[slot][offset..offset + count].fill(0.0);
                    self.mix_right[slot][offset..offset + count].fill(0.0);
                    continue;
                }
            };
            let Some(pcm) = stem.pcm() else {
                // still loading; silent until the data lands
                self.mix_left[slot][offset..offset + count].fill(0.0);
                self.mix_right[slot][offset..offset + count].fill(0.0);
                continue;
            };

            let gain = riff.gain(slot);
            let time_scale = riff.time_scale(slot);
            let stem_len = pcm.sample_count() as u64;
            if stem_len == 0 {
                self.mix_left[slot][offset..offset + count].fill(0.0);
                self.mix_right[slot][offset..offset + count].fill(0.0);
                continue;
            }

            let mut riff_sample = wrapped_start;
            let mut last_left = 0.0;
            let mut last_right = 0.0;

            for i in 0..count {
                let mut final_index = riff_sample;
                if time_scale != 1.0 {
                    final_index = (riff_sample as f64 * f64::from(time_scale)) as u64;
                }
                let final_index = (final_index % stem_len) as usize;

                last_left = pcm.left[final_index] * gain;
                last_right = pcm.right[final_index] * gain;
                self.mix_left[slot][offset + i] = last_left;
                self.mix_right[slot][offset + i] = last_right;

                riff_sample += 1;
                if riff_sample >= riff_len {
                    riff_sample -= riff_len;
                }
            }

            self.blend_cache_left[slot] = last_left;
            self.blend_cache_right[slot] = last_right;
        }

        self.playback_sample += count as u64;
    }

    fn write_silence(&mut self, offset: usize, count: usize) {
        for slot in 0..STEM_SLOTS {
            self.mix_left[slot][offset..offset + count].fill(0.0);
            self.mix_right[slot][offset..offset + count].fill(0.0);
        }
    }

    /// Lerp the first few samples of freshly rendered audio back toward the
    /// cached pre-transition values, consuming the blend curve.
    fn apply_blend(&mut self, offset: usize, limit: usize) {
        if self.blend_remaining == 0 || limit == 0 {
            return;
        }

        let n = limit.min(self.blend_remaining);
        let curve_base = BLEND_LEN - self.blend_remaining;

        for slot in 0..STEM_SLOTS {
            for i in 0..n {
                let t = self.blend_curve[curve_base + i];
                let left = self.mix_left[slot][offset + i];
                let right = self.mix_right[slot][offset + i];
                self.mix_left[slot][offset + i] =
                    left + (self.blend_active_left[slot] - left) * t;
                self.mix_right[slot][offset + i] =
                    right + (self.blend_active_right[slot] - right) * t;
            }
        }

        self.blend_remaining -= n;
    }

    /// Sum the eight per-stem channels into the output buffer.
    fn downmix(&self, output: &mut StereoBuffer, volume: f32, samples: usize) {
        for i in 0..samples {
            let mut left = 0.0;
            let mut right = 0.0;
            for slot in 0..STEM_SLOTS {
                left += self.mix_left[slot][i];
                right += self.mix_right[slot][i];
            }
            output[i].left = left * volume;
            output[i].right = right * volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JamId, JamInfo, RiffComplete, RiffId, RiffRecord, StemId, StemRecord};
    use crate::riff::LiveRiff;
    use crate::stem::LiveStem;
    use std::sync::Arc as StdArc;

    const RATE: u32 = 48_000;

    fn make_riff(id: &str, stem_value: f32) -> RiffHandle {
        // 120 BPM 4/4: 24000-sample bars, 192000-sample riff
        let mut record = RiffRecord {
            id: RiffId::from(id),
            jam_id: JamId::from("band_t"),
            bps: 2.0,
            bar_length: 4,
            gains: [1.0; STEM_SLOTS],
            ..RiffRecord::default()
        };
        record.stems[0] = StemId::from(format!("stem_{id}"));
        record.sync_active_flags();

        let stem_record = StemRecord {
            id: record.stems[0].clone(),
            bps: 2.0,
            ..StemRecord::default()
        };
        let samples = RATE as usize; // one second, repeats 4x
        let stem = StdArc::new(LiveStem::from_test_pcm(
            stem_record,
            RATE,
            vec![stem_value; samples],
            vec![stem_value; samples],
        ));

        let data = RiffComplete {
            jam: JamInfo { id: JamId::from("band_t"), display_name: "t".into() },
            riff: record,
            stems: Default::default(),
        };

        LiveRiff::with_test_stems(data, RATE, vec![(0, stem)]).into_handle()
    }

    fn make_ramp_riff(id: &str) -> RiffHandle {
        let mut record = RiffRecord {
            id: RiffId::from(id),
            jam_id: JamId::from("band_t"),
            bps: 2.0,
            bar_length: 4,
            gains: [1.0; STEM_SLOTS],
            ..RiffRecord::default()
        };
        record.stems[0] = StemId::from(format!("stem_{id}"));
        record.sync_active_flags();

        let stem_record = StemRecord {
            id: record.stems[0].clone(),
            bps: 2.0,
            ..StemRecord::default()
        };
        let samples: Vec<f32> = (0..RATE as usize).map(|i| (i % 977) as f32 / 977.0).collect();
        let stem = StdArc::new(LiveStem::from_test_pcm(
            stem_record,
            RATE,
            samples.clone(),
            samples,
        ));

        let data = RiffComplete {
            jam: JamInfo { id: JamId::from("band_t"), display_name: "t".into() },
            riff: record,
            stems: Default::default(),
        };

        LiveRiff::with_test_stems(data, RATE, vec![(0, stem)]).into_handle()
    }

    fn render_run(riff: RiffHandle, blocks: usize, block_len: usize) -> Vec<f32> {
        let (mut mixer, mut controller) = PreviewMixer::new(4096, 8, None);
        controller.enqueue_riff(riff);

        let mut out = Vec::new();
        let mut buffer = StereoBuffer::silence(block_len);
        for _ in 0..blocks {
            mixer.render(&mut buffer, 1.0, 0);
            out.extend(buffer.as_slice().iter().map(|s| s.left));
        }
        out
    }

    #[test]
    fn test_mixer_deterministic() {
        let a = render_run(make_ramp_riff("r1"), 64, 512);
        let b = render_run(make_ramp_riff("r1"), 64, 512);
        assert_eq!(a, b);
    }

    #[test]
    fn test_silence_when_idle() {
        let (mut mixer, _controller) = PreviewMixer::new(1024, 4, None);
        let mut buffer = StereoBuffer::silence(256);
        buffer[3] = crate::types::StereoSample::new(0.7, 0.7);
        mixer.render(&mut buffer, 1.0, 0);
        assert!(buffer.as_slice().iter().all(|s| s.left == 0.0 && s.right == 0.0));
    }

    #[test]
    fn test_instant_transition_starts_from_previous_sample() {
        let (mut mixer, mut controller) = PreviewMixer::new(1024, 8, None);
        let mut buffer = StereoBuffer::silence(512);

        controller.enqueue_riff(make_riff("a", 0.25));
        for _ in 0..4 {
            mixer.render(&mut buffer, 1.0, 0);
        }
        assert_eq!(buffer[511].left, 0.25);

        controller.enqueue_riff(make_riff("b", 0.5));
        mixer.render(&mut buffer, 1.0, 0);

        // blend[0] == 1.0: the first post-swap sample equals the cached last
        // sample of the outgoing riff, so the seam cannot exceed the inputs
        assert_eq!(buffer[0].left, 0.25);
        // well past the blend window the new riff plays clean
        assert_eq!(buffer[511].left, 0.5);
        // the curve decays monotonically between the two
        for i in 1..BLEND_LEN {
            assert!(buffer[i].left >= buffer[i - 1].left - 1e-6);
            assert!(buffer[i].left <= 0.5 + 1e-6);
        }
    }

    #[test]
    fn test_bar_locked_transition_lands_on_bar_boundary() {
        let (mut mixer, mut controller) = PreviewMixer::new(4096, 8, None);
        controller.set_bar_lock(true);
        controller.set_span(TransitionSpan::Once);
        controller.set_on_beat(0);

        const BLOCK: usize = 1000;
        const SAMPLES_PER_BAR: usize = 24_000;

        let mut buffer = StereoBuffer::silence(BLOCK);
        controller.enqueue_riff(make_riff("a", 0.25));

        // roll forward a while, then request the swap mid-bar
        let mut rendered: Vec<f32> = Vec::new();
        for _ in 0..5 {
            mixer.render(&mut buffer, 1.0, 0);
            rendered.extend(buffer.as_slice().iter().map(|s| s.left));
        }
        let request_sample = rendered.len();
        controller.enqueue_riff(make_riff("b", 0.5));

        for _ in 0..30 {
            mixer.render(&mut buffer, 1.0, 0);
            rendered.extend(buffer.as_slice().iter().map(|s| s.left));
        }

        // the swap is visible one sample after the boundary (blend[0] keeps
        // the boundary sample itself at the outgoing value)
        let first_changed = rendered
            .iter()
            .position(|&s| (s - 0.25).abs() > 1e-6)
            .expect("transition must have happened");
        let boundary = first_changed - 1;

        assert_eq!(boundary % SAMPLES_PER_BAR, 0, "switch not on a bar boundary");
        assert!(boundary >= request_sample);
        assert!(boundary - request_sample <= SAMPLES_PER_BAR);
    }

    #[test]
    fn test_stop_drains_to_silence() {
        let (mut mixer, mut controller) = PreviewMixer::new(1024, 8, None);
        let mut buffer = StereoBuffer::silence(256);

        controller.enqueue_riff(make_riff("a", 0.25));
        mixer.render(&mut buffer, 1.0, 0);
        assert!(buffer.peak() > 0.0);

        controller.stop();
        mixer.render(&mut buffer, 1.0, 0); // drain + blend tail
        for _ in 0..4 {
            mixer.render(&mut buffer, 1.0, 0);
        }
        assert_eq!(buffer.peak(), 0.0);
    }

    #[test]
    fn test_failed_stem_mixes_as_silence() {
        let mut record = RiffRecord {
            id: RiffId::from("rf"),
            jam_id: JamId::from("band_t"),
            bps: 2.0,
            bar_length: 4,
            gains: [1.0; STEM_SLOTS],
            ..RiffRecord::default()
        };
        record.stems[0] = StemId::from("stem_dead");
        record.sync_active_flags();

        let stem = StdArc::new(LiveStem::from_test_failure(
            StemRecord { id: StemId::from("stem_dead"), bps: 2.0, ..StemRecord::default() },
            RATE,
        ));
        let data = RiffComplete {
            jam: JamInfo { id: JamId::from("band_t"), display_name: "t".into() },
            riff: record,
            stems: Default::default(),
        };
        let riff = LiveRiff::with_test_stems(data, RATE, vec![(0, stem)]).into_handle();

        let (mut mixer, mut controller) = PreviewMixer::new(1024, 4, None);
        controller.enqueue_riff(riff);
        let mut buffer = StereoBuffer::silence(256);
        mixer.render(&mut buffer, 1.0, 0);
        mixer.render(&mut buffer, 1.0, 0);
        assert_eq!(buffer.peak(), 0.0);
    }
}
