//! OPUS broadcast encoder
//!
//! Double-buffered bridge between the audio callback and a voice-chat
//! uplink. The callback appends stereo float PCM into the active page; when
//! a page fills it swaps with the reserve page and a background thread
//! soft-clips, encodes one OPUS packet per frame and hands the finished
//! packet block to the consumer callback. The encoder thread sits adjacent
//! to the real-time path, never inside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use audiopus::coder::Encoder;
use audiopus::softclip::SoftClip;
use audiopus::{Application, Bitrate, Channels, SampleRate};

/// Samples per OPUS frame at 48 kHz (60 ms)
pub const DEFAULT_FRAME_SIZE: usize = 2880;

/// Frames buffered per page (~1.5 s of audio each)
pub const DEFAULT_BUFFERED_FRAMES: usize = 25;

/// Encoder scratch; comfortably above the worst-case packet size
const ENCODE_SCRATCH_BYTES: usize = 65536;

#[derive(Debug, Clone)]
pub struct OpusConfig {
    /// Input sample rate; OPUS wants 48 kHz for this application
    pub sample_rate: u32,
    pub frame_size: usize,
    pub buffered_frames: usize,
    pub bitrate_bps: i32,
    pub complexity: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_size: DEFAULT_FRAME_SIZE,
            buffered_frames: DEFAULT_BUFFERED_FRAMES,
            bitrate_bps: 96_000,
            complexity: 10,
        }
    }
}

/// One drained page's worth of encoded packets.
pub struct OpusPacketBlock {
    /// All packet bytes, back to back
    pub data: Vec<u8>,
    /// Length of each packet inside `data`
    pub packet_sizes: Vec<usize>,
    pub average_packet_size: usize,
    pub frame_size: usize,
}

impl OpusPacketBlock {
    pub fn packet_count(&self) -> usize {
        self.packet_sizes.len()
    }

    /// Iterate the packets as individual byte slices.
    pub fn packets(&self) -> impl Iterator<Item = &[u8]> {
        let mut offset = 0;
        self.packet_sizes.iter().map(move |&size| {
            let packet = &self.data[offset..offset + size];
            offset += size;
            packet
        })
    }
}

pub type PacketBlockCallback = Box<dyn FnMut(OpusPacketBlock) + Send>;

/// One staging page of interleaved stereo float samples.
struct Page {
    interleaved: Vec<f32>,
    /// Stereo sample pairs currently written
    used: usize,
    capacity: usize,
}

impl Page {
    fn new(capacity: usize) -> Self {
        Self {
            interleaved: vec![0.0; capacity * 2],
            used: 0,
            capacity,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    fn write(&mut self, left: &[f32], right: &[f32]) {
        let base = self.used * 2;
        for (i, (l, r)) in left.iter().zip(right.iter()).enumerate() {
            self.interleaved[base + i * 2] = *l;
            self.interleaved[base + i * 2 + 1] = *r;
        }
        self.used += left.len();
    }
}

/// Hand-off slot between the audio side and the encoder thread.
struct Exchange {
    full: Option<Page>,
    spare: Option<Page>,
}

struct SharedState {
    exchange: Mutex<Exchange>,
    wake: Condvar,
    run: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("opus encoder init failed: {0}")]
    EncoderInit(#[from] audiopus::Error),
}

pub struct OpusBroadcast {
    config: OpusConfig,
    active: Page,
    shared: Arc<SharedState>,
    worker: Option<JoinHandle<()>>,
}

impl OpusBroadcast {
    pub fn new(config: OpusConfig, on_block: PacketBlockCallback) -> Result<Self, BroadcastError> {
        let sample_rate = match config.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            _ => SampleRate::Hz48000,
        };

        let mut encoder = Encoder::new(sample_rate, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(config.bitrate_bps))?;
        encoder.set_complexity(config.complexity)?;
        encoder.set_signal(audiopus::Signal::Music)?;

        log::info!(
            "opus broadcast up: {} bps, frame {} samples, {} frames/page",
            config.bitrate_bps,
            config.frame_size,
            config.buffered_frames
        );

        let page_capacity = config.frame_size * config.buffered_frames;

        let shared = Arc::new(SharedState {
            exchange: Mutex::new(Exchange {
                full: None,
                spare: Some(Page::new(page_capacity)),
            }),
            wake: Condvar::new(),
            run: AtomicBool::new(true),
        });

        let worker_shared = shared.clone();
        let frame_size = config.frame_size;
        let worker = std::thread::Builder::new()
            .name("weft-opus-encode".to_string())
            .spawn(move || {
                encoder_thread(worker_shared, encoder, frame_size, on_block);
            })
            .expect("failed to spawn opus encoder thread");

        Ok(Self {
            config,
            active: Page::new(page_capacity),
            shared,
            worker: Some(worker),
        })
    }

    /// Append one block of stereo PCM from the audio callback. When the
    /// active page fills mid-copy the pages swap and the encoder is woken;
    /// the only lock taken is the brief exchange-slot swap.
    pub fn append_stereo(&mut self, left: &[f32], right: &[f32]) {
        debug_assert_eq!(left.len(), right.len());
        let mut offset = 0;
        let mut remaining = left.len();

        while remaining > 0 {
            let space = self.active.remaining();
            if remaining > space {
                self.active.write(&left[offset..offset + space], &right[offset..offset + space]);
                offset += space;
                remaining -= space;
                self.dispatch_active_page();
            } else {
                self.active.write(&left[offset..], &right[offset..]);
                remaining = 0;
            }
        }
    }

    /// Append from an interleaved stereo buffer.
    pub fn append_buffer(&mut self, buffer: &crate::types::StereoBuffer) {
        // page writes are pair-based; split the interleaved view once here
        let interleaved = buffer.as_interleaved();
        let pairs = interleaved.len() / 2;
        let mut left = vec![0.0f32; pairs];
        let mut right = vec![0.0f32; pairs];
        for i in 0..pairs {
            left[i] = interleaved[i * 2];
            right[i] = interleaved[i * 2 + 1];
        }
        self.append_stereo(&left, &right);
    }

    /// Push whatever is buffered to the encoder immediately, zero-padding
    /// the trailing partial frame. Called at shutdown; also lets consumers
    /// force out a block without waiting ~1.5 s for a page to fill.
    pub fn flush(&mut self) {
        if self.active.used > 0 {
            self.dispatch_active_page();
        }
    }

    /// Total staging memory held by the double buffer.
    pub fn storage_usage_bytes(&self) -> usize {
        self.config.frame_size * self.config.buffered_frames * 2 * std::mem::size_of::<f32>() * 2
    }

    fn dispatch_active_page(&mut self) {
        let page_capacity = self.config.frame_size * self.config.buffered_frames;

        let mut exchange = self.shared.exchange.lock().unwrap();
        if exchange.full.is_some() {
            // encoder has not drained the previous page yet; dropping this
            // one keeps the audio thread from ever waiting on the encoder
            log::warn!("opus broadcast overrun, dropping a page of audio");
            self.active.used = 0;
            return;
        }

        let mut replacement = exchange
            .spare
            .take()
            .unwrap_or_else(|| Page::new(page_capacity));
        replacement.used = 0;

        exchange.full = Some(std::mem::replace(&mut self.active, replacement));
        drop(exchange);

        self.shared.wake.notify_one();
    }
}

impl Drop for OpusBroadcast {
    fn drop(&mut self) {
        self.flush();
        self.shared.run.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn encoder_thread(
    shared: Arc<SharedState>,
    mut encoder: Encoder,
    frame_size: usize,
    mut on_block: PacketBlockCallback,
) {
    log::info!("opus encoder thread launched");

    let mut soft_clip = SoftClip::new(Channels::Stereo);
    let mut scratch = vec![0u8; ENCODE_SCRATCH_BYTES];

    loop {
        let mut page = {
            let mut exchange = shared.exchange.lock().unwrap();
            loop {
                if let Some(page) = exchange.full.take() {
                    break page;
                }
                if !shared.run.load(Ordering::Acquire) {
                    log::info!("opus encoder thread closing");
                    return;
                }
                exchange = shared.wake.wait(exchange).unwrap();
            }
        };

        if let Some(block) = encode_page(&mut encoder, &mut soft_clip, &mut scratch, &mut page, frame_size) {
            on_block(block);
        }

        let mut exchange = shared.exchange.lock().unwrap();
        page.used = 0;
        exchange.spare = Some(page);
    }
}

fn encode_page(
    encoder: &mut Encoder,
    soft_clip: &mut SoftClip,
    scratch: &mut [u8],
    page: &mut Page,
    frame_size: usize,
) -> Option<OpusPacketBlock> {
    if page.used == 0 {
        return None;
    }

    // partial trailing frame: zero-pad up to the frame boundary
    let packet_count = page.used.div_ceil(frame_size);
    let padded_pairs = packet_count * frame_size;
    for value in &mut page.interleaved[page.used * 2..padded_pairs * 2] {
        *value = 0.0;
    }

    // tame anything outside [-1, 1] before it hits the codec
    if let Err(err) = soft_clip.apply(&mut page.interleaved[..padded_pairs * 2]) {
        log::error!("opus soft clip failed: {err}");
        return None;
    }

    let mut data = Vec::with_capacity(packet_count * 256);
    let mut packet_sizes = Vec::with_capacity(packet_count);
    let mut total_bytes = 0usize;

    for packet in 0..packet_count {
        let start = packet * frame_size * 2;
        let frame = &page.interleaved[start..start + frame_size * 2];

        match encoder.encode_float(frame, scratch) {
            Ok(bytes) => {
                data.extend_from_slice(&scratch[..bytes]);
                packet_sizes.push(bytes);
                total_bytes += bytes;
            }
            Err(err) => {
                log::error!("opus encode failed: {err}");
                break;
            }
        }
    }

    if packet_sizes.is_empty() {
        return None;
    }

    let average_packet_size = total_bytes / packet_sizes.len();
    Some(OpusPacketBlock {
        data,
        packet_sizes,
        average_packet_size,
        frame_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn collecting_broadcast(config: OpusConfig) -> (OpusBroadcast, mpsc::Receiver<OpusPacketBlock>) {
        let (tx, rx) = mpsc::channel();
        let broadcast = OpusBroadcast::new(
            config,
            Box::new(move |block| {
                let _ = tx.send(block);
            }),
        )
        .expect("encoder init");
        (broadcast, rx)
    }

    fn sine_second() -> (Vec<f32>, Vec<f32>) {
        let left: Vec<f32> = (0..48_000)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.6)
            .collect();
        let right = left.clone();
        (left, right)
    }

    #[test]
    fn test_one_second_flush_frames_to_seventeen_packets() {
        let (mut broadcast, rx) = collecting_broadcast(OpusConfig::default());
        let (left, right) = sine_second();

        broadcast.append_stereo(&left, &right);
        broadcast.flush();

        let block = rx.recv_timeout(Duration::from_secs(10)).expect("block");
        // 48000 samples / 2880-sample frames, final partial frame padded
        assert_eq!(block.packet_count(), 17);
        assert_eq!(block.packet_sizes.iter().sum::<usize>(), block.data.len());
        assert!(block.average_packet_size > 0);
        assert_eq!(block.packets().count(), 17);
    }

    #[test]
    fn test_full_page_dispatches_without_flush() {
        let config = OpusConfig { buffered_frames: 4, ..OpusConfig::default() };
        let page_samples = config.frame_size * config.buffered_frames;
        let (mut broadcast, rx) = collecting_broadcast(config);

        // one sample beyond the page forces the mid-copy swap
        let left = vec![0.1f32; page_samples + 1];
        let right = vec![0.1f32; page_samples + 1];
        broadcast.append_stereo(&left, &right);

        let block = rx.recv_timeout(Duration::from_secs(10)).expect("block");
        assert_eq!(block.packet_count(), 4);
    }

    #[test]
    fn test_drop_flushes_partial_page() {
        let (broadcast, rx) = {
            let (mut broadcast, rx) = collecting_broadcast(OpusConfig::default());
            let left = vec![0.2f32; 5000];
            let right = vec![0.2f32; 5000];
            broadcast.append_stereo(&left, &right);
            (broadcast, rx)
        };
        drop(broadcast);

        let block = rx.recv_timeout(Duration::from_secs(10)).expect("block");
        assert_eq!(block.packet_count(), 2); // 5000 samples -> 2 padded frames
    }
}
