//! Domain model shared between the live runtime and the warehouse
//!
//! Identifiers are opaque short strings assigned by the upstream service;
//! they are wrapped in newtypes so a stem id can never be handed somewhere a
//! riff id belongs. The metadata records mirror the warehouse row layout.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::STEM_SLOTS;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(JamId);
id_newtype!(RiffId);
id_newtype!(StemId);

impl JamId {
    /// Sentinel jam id used when requesting a publicly shared riff; these are
    /// resolved through a different upstream endpoint and the real owning jam
    /// is recovered from the stem audio URLs.
    pub fn shared_riff_sentinel() -> Self {
        Self("shared_riff".to_owned())
    }

    pub fn is_shared_riff_sentinel(&self) -> bool {
        self.0 == "shared_riff"
    }
}

/// Stable fingerprint of a riff id, used as the key for the pipeline's
/// live-riff LRU and for cheap equality checks in the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RiffFingerprint(pub u64);

impl RiffFingerprint {
    pub fn of(riff_id: &RiffId) -> Self {
        let mut hasher = DefaultHasher::new();
        riff_id.0.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Round a beats-per-second value to the whole BPM the upstream UI displays.
#[inline]
pub fn bps_to_rounded_bpm(bps: f32) -> f32 {
    (bps * 60.0).round()
}

/// Musical root note names, index 0..=12 (12 is the "no root" marker).
pub const ROOT_NAMES: [&str; 13] = [
    "C", "Db", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B", "-",
];

/// Scale names as shown in the upstream client, index 0..=17.
pub const SCALE_NAMES: [&str; 18] = [
    "Major (Ionian)",
    "Dorian",
    "Phrygian",
    "Lydian",
    "Mixolydian",
    "Minor (Aeolian)",
    "Locrian",
    "Minor Pentatonic",
    "Major Pentatonic",
    "Suspended Pent.",
    "Blues Minor Pent.",
    "Blues Major Pent.",
    "Harmonic Minor",
    "Melodic Minor",
    "Double Harmonic",
    "Blues",
    "Whole Tone",
    "Chromatic",
];

/// Scale names safe for use inside filenames.
pub const SCALE_FILE_NAMES: [&str; 18] = [
    "major",
    "dorian",
    "phrygian",
    "lydian",
    "mixoly",
    "minor",
    "locrian",
    "minor_pent",
    "major_pent",
    "susp_pent",
    "blues_mnr_p",
    "blues_mjr_p",
    "harmonic_mnr",
    "melodic_mnr",
    "dbl_harmonic",
    "blues",
    "whole",
    "chromatic",
];

/// Instrument classification bits carried on a stem.
///
/// The bit positions match the packed integer stored in the warehouse, so
/// round-tripping through the database is loss-free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentFlags {
    pub drum: bool,
    pub note: bool,
    pub bass: bool,
    pub mic: bool,
}

impl InstrumentFlags {
    pub fn to_mask(self) -> i32 {
        (self.drum as i32) << 1 | (self.note as i32) << 2 | (self.bass as i32) << 3 | (self.mic as i32) << 4
    }

    pub fn from_mask(mask: i32) -> Self {
        Self {
            drum: mask & (1 << 1) != 0,
            note: mask & (1 << 2) != 0,
            bass: mask & (1 << 3) != 0,
            mic: mask & (1 << 4) != 0,
        }
    }
}

/// Fully populated riff metadata, one row of the warehouse Riffs table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiffRecord {
    pub id: RiffId,
    pub jam_id: JamId,
    /// Unix seconds; 0 on skeleton rows that have not been populated yet
    pub creation_time: i64,
    /// Musical root, 0..=12
    pub root: u32,
    /// Scale index, 0..=17
    pub scale: u32,
    /// Beats per second (canonical tempo storage; BPM = BPS * 60)
    pub bps: f32,
    pub bpm_rnd: f32,
    /// Bar length in quarter-beat units (4, 8 or 16)
    pub bar_length: i32,
    pub app_version: i32,
    /// Perceptual loudness magnitude, informational only
    pub magnitude: f32,
    pub user: String,
    /// Eight stem slots; an empty id marks an unused slot
    pub stems: [StemId; STEM_SLOTS],
    pub gains: [f32; STEM_SLOTS],
    /// Redundant with a non-empty slot id; kept consistent on every write
    pub stems_on: [bool; STEM_SLOTS],
}

impl RiffRecord {
    /// Re-derive the active flags from the slot ids; call after any slot edit.
    pub fn sync_active_flags(&mut self) {
        for slot in 0..STEM_SLOTS {
            self.stems_on[slot] = !self.stems[slot].is_empty();
        }
    }

    /// Ids of every non-empty stem slot, in slot order.
    pub fn active_stem_ids(&self) -> Vec<StemId> {
        self.stems
            .iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect()
    }
}

/// Fully populated stem metadata, one row of the warehouse Stems table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StemRecord {
    pub id: StemId,
    pub jam_id: JamId,
    /// Unix seconds; 0 on skeleton rows
    pub creation_time: i64,
    pub file_endpoint: String,
    pub file_bucket: String,
    pub file_key: String,
    pub file_mime: String,
    pub file_length_bytes: u64,
    pub bps: f32,
    pub bpm_rnd: f32,
    pub instrument: InstrumentFlags,
    pub length_16ths: f32,
    pub original_pitch: f32,
    pub bar_length: f32,
    pub preset: String,
    pub user: String,
    /// Sample rate of the stored audio; resampled on load when it differs
    /// from the playback rate
    pub sample_rate: u32,
    /// Display colour as packed hex, e.g. "ff8040"
    pub colour: String,
}

impl StemRecord {
    /// Full download URL on the CDN for this stem's compressed audio.
    pub fn cdn_url(&self) -> String {
        format!("https://{}/{}", self.file_endpoint, self.file_key)
    }
}

/// Jam identity plus its human-visible name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JamInfo {
    pub id: JamId,
    pub display_name: String,
}

/// Everything needed to turn a riff identity into live audio: the jam, the
/// riff row and the populated rows for each active stem slot.
#[derive(Debug, Clone, Default)]
pub struct RiffComplete {
    pub jam: JamInfo,
    pub riff: RiffRecord,
    pub stems: [Option<StemRecord>; STEM_SLOTS],
}

/// User annotation on a riff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiffTag {
    pub jam_id: JamId,
    pub riff_id: RiffId,
    /// Ordering index within the jam; negative asks the warehouse to append
    /// after the current highest value
    pub ordering: i32,
    pub timestamp: i64,
    pub favour: i32,
    pub note: String,
}

/// Network tuning for CDN stem fetches.
///
/// The `allow_*` flags exist because the upstream service has shipped
/// malformed data in the past; they stay as explicit configuration rather
/// than hard-coded behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPolicy {
    /// Connection and read timeout for each request, seconds
    pub timeout_secs: u32,
    /// Accept a CDN content-length that disagrees with the warehouse record
    /// and reallocate to match
    pub allow_stem_size_mismatch: bool,
    /// Accept a truncated stream body and clamp the PCM to what arrived
    pub allow_stem_underflow: bool,
    pub user_agent: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 2,
            allow_stem_size_mismatch: true,
            allow_stem_underflow: false,
            user_agent: "weft/0.4".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable() {
        let a = RiffFingerprint::of(&RiffId::from("riff_0001"));
        let b = RiffFingerprint::of(&RiffId::from("riff_0001"));
        let c = RiffFingerprint::of(&RiffId::from("riff_0002"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_instrument_mask_round_trip() {
        let flags = InstrumentFlags { drum: true, note: false, bass: true, mic: false };
        assert_eq!(InstrumentFlags::from_mask(flags.to_mask()), flags);
        assert_eq!(flags.to_mask(), (1 << 1) | (1 << 3));
    }

    #[test]
    fn test_active_flags_follow_slots() {
        let mut riff = RiffRecord::default();
        riff.stems[2] = StemId::from("stem_aa");
        riff.sync_active_flags();
        assert!(riff.stems_on[2]);
        assert!(!riff.stems_on[0]);
        assert_eq!(riff.active_stem_ids(), vec![StemId::from("stem_aa")]);
    }

    #[test]
    fn test_rounded_bpm() {
        assert_eq!(bps_to_rounded_bpm(2.0), 120.0);
        assert_eq!(bps_to_rounded_bpm(2.916_666_7), 175.0);
    }
}
