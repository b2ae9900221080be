//! Live stem store
//!
//! A `LiveStem` owns the decoded stereo PCM for one stem: it pulls the
//! compressed audio from the local disk cache or the CDN, decodes it,
//! resamples to the playback rate and (separately) runs the energy/beat
//! analysis pass. State is published through an atomic so the mixer can poll
//! it without locks; PCM and analysis land in `OnceLock`s and are only ever
//! observed after the state says they exist.

pub mod analysis;

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rand::Rng;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub use analysis::{AnalysisParams, StemAnalysis};

use crate::model::{FetchPolicy, StemRecord};
use crate::riff::TaskGate;

/// Samples blended across the loop seam to kill clicks on wrap-around
const LOOP_SEW_WINDOW: usize = 128;

/// CDN fetch attempts before giving up on a stem
const FETCH_ATTEMPTS: u32 = 3;

/// Lifecycle of a stem's audio data. Every `Failed*` state is terminal; the
/// owning riff mixes a failed stem as silence without failing itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StemState {
    Empty = 0,
    WorkEnqueued,
    Complete,
    FailedHttp,
    FailedDataUnderflow,
    FailedDataOverflow,
    FailedDecode,
    FailedCacheDirectory,
}

impl StemState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StemState::Empty,
            1 => StemState::WorkEnqueued,
            2 => StemState::Complete,
            3 => StemState::FailedHttp,
            4 => StemState::FailedDataUnderflow,
            5 => StemState::FailedDataOverflow,
            6 => StemState::FailedDecode,
            _ => StemState::FailedCacheDirectory,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StemState::FailedHttp
                | StemState::FailedDataUnderflow
                | StemState::FailedDataOverflow
                | StemState::FailedDecode
                | StemState::FailedCacheDirectory
        )
    }
}

/// Compressed container the upstream stored this stem in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    OggVorbis,
    Flac,
}

impl CompressionFormat {
    fn from_mime(mime: &str) -> Self {
        if mime.contains("flac") {
            CompressionFormat::Flac
        } else {
            CompressionFormat::OggVorbis
        }
    }

    fn extension(self) -> &'static str {
        match self {
            CompressionFormat::OggVorbis => "ogg",
            CompressionFormat::Flac => "flac",
        }
    }

    fn magic_matches(self, bytes: &[u8]) -> bool {
        match self {
            CompressionFormat::OggVorbis => bytes.starts_with(b"OggS"),
            CompressionFormat::Flac => bytes.starts_with(b"fLaC"),
        }
    }
}

/// Decoded stereo PCM at the playback rate.
#[derive(Debug, Default)]
pub struct StemPcm {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StemPcm {
    #[inline]
    pub fn sample_count(&self) -> usize {
        self.left.len()
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("http: {0}")]
    Http(String),
    #[error("body shorter than expected ({got} < {want})")]
    Underflow { got: usize, want: usize },
    #[error("body longer than expected ({got} > {want})")]
    Overflow { got: usize, want: usize },
}

pub struct LiveStem {
    record: StemRecord,
    target_rate: u32,
    state: AtomicU8,
    pcm: OnceLock<StemPcm>,
    analysis: OnceLock<StemAnalysis>,
    /// Completion gate for the analysis task graph this stem was scheduled
    /// into; the running task also holds a strong handle to this stem, which
    /// is what keeps the PCM alive until analysis exits.
    analysis_gate: Mutex<Option<Arc<TaskGate>>>,
}

impl LiveStem {
    pub fn new(record: StemRecord, target_rate: u32) -> Self {
        log::debug!("stem allocated [{}]", record.id);
        Self {
            record,
            target_rate,
            state: AtomicU8::new(StemState::Empty as u8),
            pcm: OnceLock::new(),
            analysis: OnceLock::new(),
            analysis_gate: Mutex::new(None),
        }
    }

    #[inline]
    pub fn record(&self) -> &StemRecord {
        &self.record
    }

    #[inline]
    pub fn state(&self) -> StemState {
        StemState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StemState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn has_failed(&self) -> bool {
        self.state().is_failure()
    }

    pub fn compression_format(&self) -> CompressionFormat {
        CompressionFormat::from_mime(&self.record.file_mime)
    }

    /// Decoded PCM, available once the state is `Complete`.
    #[inline]
    pub fn pcm(&self) -> Option<&StemPcm> {
        self.pcm.get()
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.pcm.get().map_or(0, StemPcm::sample_count)
    }

    #[inline]
    pub fn analysis(&self) -> Option<&StemAnalysis> {
        self.analysis.get()
    }

    pub fn is_analysis_complete(&self) -> bool {
        self.analysis.get().is_some()
    }

    /// Remember the completion gate of the analysis graph so callers holding
    /// only this stem can still wait for outstanding analysis work.
    pub fn keep_gate(&self, gate: Arc<TaskGate>) {
        *self.analysis_gate.lock().unwrap() = Some(gate);
    }

    /// Block until any scheduled analysis has finished.
    pub fn wait_for_analysis(&self) {
        let gate = self.analysis_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait_idle();
        }
    }

    pub fn estimate_memory_usage_bytes(&self) -> usize {
        let mut total = std::mem::size_of::<Self>();
        if let Some(pcm) = self.pcm.get() {
            total += (pcm.left.len() + pcm.right.len()) * std::mem::size_of::<f32>();
        }
        if let Some(analysis) = self.analysis.get() {
            total += analysis.memory_usage_bytes();
        }
        total
    }

    // ── acquisition ────────────────────────────────────────────────────────

    /// Acquire decompressed PCM for this stem: disk cache first, CDN on miss,
    /// then decode / resample / seam-blend. Blocking; run on a worker.
    pub fn fetch(&self, policy: &FetchPolicy, cache_dir: &Path) {
        if let Err(err) = fs::create_dir_all(cache_dir) {
            log::error!("unable to create stem cache dir [{}]: {err}", cache_dir.display());
            self.set_state(StemState::FailedCacheDirectory);
            return;
        }

        self.set_state(StemState::WorkEnqueued);

        let format = self.compression_format();
        let cache_file = cache_dir.join(format!("stem.{}.{}", self.record.id, format.extension()));

        let raw = match self.acquire_raw_bytes(policy, &cache_file) {
            Some(raw) => raw,
            None => return, // failure state already set
        };

        if !format.magic_matches(&raw) {
            log::error!("stem [{}] magic header does not match {:?}", self.record.id, format);
            self.set_state(StemState::FailedDecode);
            return;
        }

        let (mut left, mut right, native_rate) = match decode_stereo(&raw, format) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::error!("stem [{}] decode failed: {err}", self.record.id);
                self.set_state(StemState::FailedDecode);
                return;
            }
        };

        // decode validated the payload; now it is worth keeping on disk
        if !cache_file.exists() {
            if let Err(err) = fs::write(&cache_file, &raw) {
                log::warn!("stem [{}] cache writeback failed: {err}", self.record.id);
            }
        }

        if native_rate != self.target_rate {
            log::debug!("resampling [{}] from {native_rate} to {}", self.record.id, self.target_rate);
            match resample_stereo(&left, &right, native_rate, self.target_rate) {
                Ok((l, r)) => {
                    left = l;
                    right = r;
                }
                Err(err) => {
                    log::error!("stem [{}] resample failed: {err}", self.record.id);
                    self.set_state(StemState::FailedDecode);
                    return;
                }
            }
        }

        loop_sew(&mut left);
        loop_sew(&mut right);

        let sample_count = left.len();
        let _ = self.pcm.set(StemPcm { left, right });
        self.set_state(StemState::Complete);

        log::debug!(
            "stem [{}] ready: {} samples, ~{} bytes",
            self.record.id,
            sample_count,
            self.estimate_memory_usage_bytes()
        );
    }

    /// Run the energy / beat analysis pass over decoded PCM. A no-op on
    /// failed or not-yet-complete stems.
    pub fn analyse(&self, params: &AnalysisParams) {
        let Some(pcm) = self.pcm.get() else {
            log::debug!("stem [{}] skipping analysis, no PCM", self.record.id);
            return;
        };
        let result = analysis::analyse_pcm(pcm, self.target_rate, params);
        let _ = self.analysis.set(result);
    }

    fn acquire_raw_bytes(&self, policy: &FetchPolicy, cache_file: &Path) -> Option<Vec<u8>> {
        let expected = self.record.file_length_bytes as usize;

        if cache_file.exists() {
            match fs::read(cache_file) {
                Ok(bytes) => {
                    if bytes.len() != expected {
                        if !bytes.is_empty() && policy.allow_stem_size_mismatch {
                            log::warn!(
                                "cached stem [{}] size mismatch accepted: expected {expected}, got {}",
                                self.record.id,
                                bytes.len()
                            );
                        } else {
                            log::error!(
                                "cached stem [{}] size mismatch: expected {expected}, got {}",
                                self.record.id,
                                bytes.len()
                            );
                            self.set_state(StemState::FailedDataUnderflow);
                            return None;
                        }
                    }
                    log::debug!("cached [{}]", self.record.id);
                    return Some(bytes);
                }
                Err(err) => {
                    log::warn!("cached stem [{}] unreadable, refetching: {err}", self.record.id);
                }
            }
        }

        let url = self.record.cdn_url();
        let mut rng = rand::thread_rng();

        // the CDN can lag behind the metadata service; retry with widening
        // jittered gaps before calling it lost
        for attempt in 0..FETCH_ATTEMPTS {
            let delay_ms = rng.gen_range(250..=750) + u64::from(attempt) * 1500;
            std::thread::sleep(Duration::from_millis(delay_ms));

            match self.attempt_remote_fetch(policy, &url, expected) {
                Ok(bytes) => return Some(bytes),
                Err(FetchError::Http(err)) => {
                    log::warn!("fetch attempt {} for [{}] failed: {err}", attempt + 1, self.record.id);
                    self.set_state(StemState::FailedHttp);
                }
                Err(FetchError::Underflow { got, want }) => {
                    log::error!("stem [{}] body underflow ({got} of {want})", self.record.id);
                    self.set_state(StemState::FailedDataUnderflow);
                    return None;
                }
                Err(FetchError::Overflow { got, want }) => {
                    log::error!("stem [{}] body overflow ({got} > {want})", self.record.id);
                    self.set_state(StemState::FailedDataOverflow);
                    return None;
                }
            }
        }

        log::error!("unable to acquire [{}]", self.record.file_key);
        None
    }

    fn attempt_remote_fetch(
        &self,
        policy: &FetchPolicy,
        url: &str,
        expected: usize,
    ) -> Result<Vec<u8>, FetchError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(u64::from(policy.timeout_secs)))
            .timeout(Duration::from_secs(u64::from(policy.timeout_secs) * 10))
            .build();

        // HEAD precheck: make sure the CDN agrees about the payload size
        let head = agent
            .head(url)
            .set("User-Agent", &policy.user_agent)
            .set("Accept", "audio/ogg")
            .call()
            .map_err(|err| FetchError::Http(err.to_string()))?;

        let mut expected = expected;
        if let Some(len) = head.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if len != expected {
                if len > 0 && policy.allow_stem_size_mismatch {
                    log::warn!(
                        "HEAD [{}] content-length mismatch accepted: CDN {len}, record {expected}",
                        self.record.file_key
                    );
                    expected = len;
                } else {
                    return Err(FetchError::Http(format!(
                        "content-length mismatch: CDN {len}, record {expected}"
                    )));
                }
            }
        }

        let response = agent
            .get(url)
            .set("User-Agent", &policy.user_agent)
            .set("Accept", "audio/ogg")
            .call()
            .map_err(|err| FetchError::Http(err.to_string()))?;

        let mut bytes = Vec::with_capacity(expected + 1);
        response
            .into_reader()
            .take(expected as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|err| FetchError::Http(err.to_string()))?;

        if bytes.len() > expected {
            return Err(FetchError::Overflow { got: bytes.len(), want: expected });
        }
        if bytes.len() < expected {
            if policy.allow_stem_underflow && !bytes.is_empty() {
                log::warn!(
                    "stem [{}] accepted short body ({} of {expected})",
                    self.record.file_key,
                    bytes.len()
                );
                return Ok(bytes);
            }
            return Err(FetchError::Underflow { got: bytes.len(), want: expected });
        }

        Ok(bytes)
    }

    /// Build a stem directly from PCM, bypassing the network path. Test
    /// support for the mixer / riff / cache suites.
    #[cfg(test)]
    pub(crate) fn from_test_pcm(record: StemRecord, rate: u32, left: Vec<f32>, right: Vec<f32>) -> Self {
        let stem = Self::new(record, rate);
        let _ = stem.pcm.set(StemPcm { left, right });
        stem.set_state(StemState::Complete);
        stem
    }

    /// Build a stem pinned into a terminal failure state. Test support.
    #[cfg(test)]
    pub(crate) fn from_test_failure(record: StemRecord, rate: u32) -> Self {
        let stem = Self::new(record, rate);
        stem.set_state(StemState::FailedHttp);
        stem
    }
}

impl Drop for LiveStem {
    fn drop(&mut self) {
        log::debug!("stem released [{}]", self.record.id);
    }
}

// ── decode / resample helpers ──────────────────────────────────────────────

fn decode_stereo(
    raw: &[u8],
    format: CompressionFormat,
) -> Result<(Vec<f32>, Vec<f32>, u32), String> {
    let cursor = std::io::Cursor::new(raw.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|err| format!("format probe failed: {err}"))?;

    let mut reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| "no default audio track".to_string())?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| "missing channel metadata".to_string())?
        .count();
    if channels != 2 {
        return Err(format!("expected stereo, got {channels} channels"));
    }

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| "missing sample-rate metadata".to_string())?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| format!("decoder creation failed: {err}"))?;

    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut sample_buffer: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => break, // end of stream
            Err(SymphoniaError::ResetRequired) => {
                return Err("unsupported mid-stream format change".to_string())
            }
            Err(err) => return Err(format!("packet read error: {err}")),
        };

        let decoded = decoder
            .decode(&packet)
            .map_err(|err| format!("decode failure: {err}"))?;

        let spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        let buffer =
            sample_buffer.get_or_insert_with(|| SampleBuffer::<f32>::new(capacity, spec));
        buffer.copy_interleaved_ref(decoded);

        for frame in buffer.samples().chunks_exact(2) {
            left.push(frame[0]);
            right.push(frame[1]);
        }
    }

    if left.is_empty() {
        return Err("decoded zero samples".to_string());
    }

    Ok((left, right, sample_rate))
}

fn resample_stereo(
    left: &[f32],
    right: &[f32],
    from_rate: u32,
    to_rate: u32,
) -> Result<(Vec<f32>, Vec<f32>), String> {
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(to_rate) / f64::from(from_rate),
        2.0,
        params,
        left.len(),
        2,
    )
    .map_err(|err| format!("resampler init: {err}"))?;

    let mut output = resampler
        .process(&[left, right], None)
        .map_err(|err| format!("resampler run: {err}"))?;

    let right_out = output.pop().unwrap_or_default();
    let left_out = output.pop().unwrap_or_default();
    Ok((left_out, right_out))
}

/// Crossfade the loop seam: the first few samples are blended with the
/// buffer tail so the wrap-around point is continuous.
fn loop_sew(channel: &mut [f32]) {
    let len = channel.len();
    if len < LOOP_SEW_WINDOW * 2 {
        return;
    }
    let tail_start = len - LOOP_SEW_WINDOW;
    for i in 0..LOOP_SEW_WINDOW {
        let t = i as f32 / LOOP_SEW_WINDOW as f32;
        channel[i] = channel[i] * t + channel[tail_start + i] * (1.0 - t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StemId;

    fn record(id: &str) -> StemRecord {
        StemRecord {
            id: StemId::from(id),
            file_mime: "audio/ogg".to_owned(),
            ..StemRecord::default()
        }
    }

    #[test]
    fn test_state_machine_failure_is_terminal() {
        let stem = LiveStem::from_test_failure(record("s1"), 48_000);
        assert!(stem.has_failed());
        assert_eq!(stem.state(), StemState::FailedHttp);
        assert!(stem.pcm().is_none());
    }

    #[test]
    fn test_loop_sew_makes_seam_continuous() {
        // a ramp that jumps hard at the loop point
        let mut channel: Vec<f32> = (0..1024).map(|i| i as f32 / 1024.0).collect();
        let raw_jump = (channel[0] - channel[1023]).abs();
        loop_sew(&mut channel);
        let sewn_jump = (channel[0] - channel[1023]).abs();
        assert!(sewn_jump < raw_jump);
        // first sewn sample equals the tail value it was blended toward
        assert!((channel[0] - channel[1024 - LOOP_SEW_WINDOW]).abs() < 1e-6);
    }

    #[test]
    fn test_magic_check() {
        assert!(CompressionFormat::OggVorbis.magic_matches(b"OggS\x00rest"));
        assert!(!CompressionFormat::OggVorbis.magic_matches(b"RIFF"));
        assert!(CompressionFormat::Flac.magic_matches(b"fLaC\x00"));
        assert_eq!(CompressionFormat::from_mime("audio/flac"), CompressionFormat::Flac);
    }

    #[test]
    fn test_memory_estimate_tracks_pcm() {
        let stem = LiveStem::from_test_pcm(record("s2"), 48_000, vec![0.0; 1000], vec![0.0; 1000]);
        assert!(stem.estimate_memory_usage_bytes() >= 2000 * std::mem::size_of::<f32>());
    }
}
