//! Stem energy and beat analysis
//!
//! Runs a fixed-window FFT over the left channel, tracks low-band energy
//! against a rolling average with a Schmitt trigger to place beats, and
//! produces per-sample u8 curves (waveform RMS, beat impulse, low band, high
//! band) plus a packed one-bit-per-sample beat field. The curves drive UI
//! visualisation and beat-reactive consumers; nothing here sits on the
//! real-time path.

use realfft::RealFftPlanner;

use super::StemPcm;

/// FFT window; also the granularity of the energy curves
const FFT_WINDOW: usize = 1024;

/// Rolling history used for the average-energy baseline, in windows
const ENERGY_HISTORY: usize = 42;

/// Spectrum bins averaged into the low band (DC excluded)
const LOW_BAND_BINS: std::ops::Range<usize> = 1..33;

/// Spectrum bins averaged into the high band
const HIGH_BAND_BINS: std::ops::Range<usize> = 352..513;

/// Tunables for the beat detector.
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    /// Base threshold multiplier applied to the average energy
    pub beat_sensitivity: f32,
    /// How much spectral variance suppresses the trigger threshold
    pub variance_scale: f32,
    /// Fractional drop below threshold required before re-arming
    pub beat_hysteresis: f32,
    /// Per-sample decay applied to the follower curves
    pub follower_decay: f32,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            beat_sensitivity: 1.125,
            variance_scale: 0.3,
            beat_hysteresis: 0.125,
            follower_decay: 0.9995,
        }
    }
}

/// Schmitt trigger: fires once when the value crosses above the threshold,
/// re-arms only after it falls back past the hysteresis band.
struct SchmittLatch {
    hysteresis: f32,
    engaged: bool,
}

impl SchmittLatch {
    fn new(hysteresis: f32) -> Self {
        Self { hysteresis, engaged: false }
    }

    fn update(&mut self, value: f32, threshold: f32) -> bool {
        if self.engaged {
            if value < threshold * (1.0 - self.hysteresis) {
                self.engaged = false;
            }
            false
        } else if value > threshold && threshold > 0.0 {
            self.engaged = true;
            true
        } else {
            false
        }
    }
}

/// Per-sample analysis results, quantised to u8. Each curve stores the scale
/// that maps 255 back to the original peak value.
#[derive(Debug, Default)]
pub struct StemAnalysis {
    pub wave_rms: Vec<u8>,
    pub beat_curve: Vec<u8>,
    pub low_band: Vec<u8>,
    pub high_band: Vec<u8>,
    pub wave_peak: f32,
    pub low_peak: f32,
    pub high_peak: f32,
    /// One bit per sample; a set bit marks the onset sample of a beat
    pub beat_bits: Vec<u64>,
    pub beat_count: usize,
}

impl StemAnalysis {
    pub fn is_empty(&self) -> bool {
        self.wave_rms.is_empty()
    }

    /// Whether a beat onset lands on the given sample.
    #[inline]
    pub fn beat_at(&self, sample: usize) -> bool {
        self.beat_bits
            .get(sample >> 6)
            .is_some_and(|block| block & (1u64 << (sample & 63)) != 0)
    }

    pub fn memory_usage_bytes(&self) -> usize {
        self.wave_rms.len()
            + self.beat_curve.len()
            + self.low_band.len()
            + self.high_band.len()
            + self.beat_bits.len() * std::mem::size_of::<u64>()
    }
}

/// Run the full analysis pass over decoded PCM.
pub fn analyse_pcm(pcm: &StemPcm, _sample_rate: u32, params: &AnalysisParams) -> StemAnalysis {
    let sample_count = pcm.left.len();

    // too short to say anything useful about
    if sample_count <= FFT_WINDOW {
        return StemAnalysis::default();
    }

    let windows = sample_count / FFT_WINDOW;

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_WINDOW);
    let mut fft_input = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();
    let mut scratch = fft.make_scratch_vec();

    let window_rcp = 1.0 / FFT_WINDOW as f32;

    let mut low_per_window = vec![0.0f32; windows];
    let mut high_per_window = vec![0.0f32; windows];
    let mut rms_per_window = vec![0.0f32; windows];
    let mut variance_per_window = vec![0.0f32; windows];

    for w in 0..windows {
        let start = w * FFT_WINDOW;
        let frame = &pcm.left[start..start + FFT_WINDOW];
        fft_input.copy_from_slice(frame);

        rms_per_window[w] =
            (frame.iter().map(|s| s * s).sum::<f32>() * window_rcp).sqrt();

        if fft
            .process_with_scratch(&mut fft_input, &mut spectrum, &mut scratch)
            .is_err()
        {
            continue;
        }

        let magnitude =
            |bin: usize| -> f32 { 2.0 * spectrum[bin].norm() * window_rcp };

        let low: f32 = LOW_BAND_BINS.clone().map(magnitude).sum::<f32>()
            / LOW_BAND_BINS.len() as f32;
        let high: f32 = HIGH_BAND_BINS.clone().map(magnitude).sum::<f32>()
            / HIGH_BAND_BINS.len() as f32;

        low_per_window[w] = if low > 1.0e-4 { low } else { 0.0 };
        high_per_window[w] = high;

        // variance of the low bins against the band mean; busy spectra make
        // the beat threshold harder to cross
        let variance: f32 = LOW_BAND_BINS
            .clone()
            .map(|bin| {
                let delta = magnitude(bin) - low;
                delta * delta
            })
            .sum::<f32>()
            / LOW_BAND_BINS.len() as f32;
        variance_per_window[w] = variance;
    }

    // rolling average of the low band; run twice so the baseline reflects how
    // energy flows through the loop rather than ramping from silence
    let mut avg_energy = vec![0.0f32; windows];
    let mut history = [0.0f32; ENERGY_HISTORY];
    let mut history_index = 0usize;
    for pass in 0..2 {
        for w in 0..windows {
            let average = history.iter().sum::<f32>() / ENERGY_HISTORY as f32;
            history[history_index] = low_per_window[w];
            history_index = (history_index + 1) % ENERGY_HISTORY;

            avg_energy[w] = if pass == 0 {
                average
            } else {
                avg_energy[w].max(average)
            };
        }
    }

    let mut result = StemAnalysis {
        wave_rms: vec![0; sample_count],
        beat_curve: vec![0; sample_count],
        low_band: vec![0; sample_count],
        high_band: vec![0; sample_count],
        beat_bits: vec![0; (sample_count >> 6) + 1],
        ..StemAnalysis::default()
    };

    result.wave_peak = rms_per_window.iter().cloned().fold(0.0, f32::max).max(1.0e-6);
    result.low_peak = low_per_window.iter().cloned().fold(0.0, f32::max).max(1.0e-6);
    result.high_peak = high_per_window.iter().cloned().fold(0.0, f32::max).max(1.0e-6);

    let mut trigger = SchmittLatch::new(params.beat_hysteresis);
    let mut wave_follower = 0.0f32;
    let mut high_follower = 0.0f32;
    let mut beat_follower = 0.0f32;

    for w in 0..windows {
        let start = w * FFT_WINDOW;

        let beat_coeff =
            (-params.variance_scale * variance_per_window[w]) + params.beat_sensitivity;
        let is_beat = trigger.update(low_per_window[w], avg_energy[w] * beat_coeff);

        if is_beat {
            result.beat_bits[start >> 6] |= 1u64 << (start & 63);
            result.beat_count += 1;
            beat_follower = 1.0;
        }

        let low_q = quantise(low_per_window[w], result.low_peak);
        let wave_target = rms_per_window[w] / result.wave_peak;
        let high_target = high_per_window[w] / result.high_peak;

        for i in start..start + FFT_WINDOW {
            wave_follower = wave_target.max(wave_follower * params.follower_decay);
            high_follower = high_target.max(high_follower * params.follower_decay);
            beat_follower *= params.follower_decay;

            result.wave_rms[i] = quantise(wave_follower, 1.0);
            result.high_band[i] = quantise(high_follower, 1.0);
            result.beat_curve[i] = quantise(beat_follower, 1.0);
            result.low_band[i] = low_q;
        }
    }

    result
}

#[inline]
fn quantise(value: f32, peak: f32) -> u8 {
    ((value / peak).clamp(0.0, 1.0) * 255.0) as u8
}
