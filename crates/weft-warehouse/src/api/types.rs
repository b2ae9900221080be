//! Upstream document shapes
//!
//! Serde mirrors of the couch-style documents the metadata service returns.
//! Years of upstream client versions have left this data in rough shape:
//! optional fields appear and vanish, endpoints sometimes arrive with a
//! scheme baked in, keys go missing. The normalisation here patches the
//! known damage at parse time so the rest of the warehouse sees one shape.

use serde::Deserialize;

use weft_core::model::{
    bps_to_rounded_bpm, InstrumentFlags, JamId, RiffId, RiffRecord, StemId, StemRecord,
};
use weft_core::types::STEM_SLOTS;

// ── generic couch envelopes ────────────────────────────────────────────────

/// Response to a batched `_all_docs` query.
#[derive(Debug, Deserialize)]
pub struct AllDocsResponse<D> {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default = "Vec::new")]
    pub rows: Vec<DocRow<D>>,
}

/// One row of an `_all_docs` response. `error` is set (and everything else
/// absent) when the key no longer resolves to a document.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "D: serde::Deserialize<'de>"))]
pub struct DocRow<D> {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub value: Option<RowValue>,
    #[serde(default)]
    pub doc: Option<D>,
}

impl<D> DocRow<D> {
    /// The key this row was queried by, whichever field carried it.
    pub fn lookup_key(&self) -> &str {
        self.key.as_deref().or(self.id.as_deref()).unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RowValue {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub rev: Option<String>,
}

/// Response to a design-document view query; `rows` may be elided when the
/// caller only wants `total_rows`.
#[derive(Debug, Deserialize)]
pub struct ViewResponse {
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default = "Vec::new")]
    pub rows: Vec<ViewRow>,
}

/// One view row: a riff id plus the stem ids it referenced at save time.
#[derive(Debug, Deserialize)]
pub struct ViewRow {
    pub id: RiffId,
    #[serde(default)]
    pub value: Vec<StemId>,
}

/// `_changes` feed response; only the pieces the sync logic reads.
#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub last_seq: Option<serde_json::Value>,
    #[serde(default = "Vec::new")]
    pub results: Vec<ChangeRow>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

// ── jam profile ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct JamProfileDoc {
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub app_version: i32,
    #[serde(default)]
    pub bio: String,
}

// ── riff documents ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RiffDocument {
    #[serde(rename = "_id")]
    pub id: RiffId,
    pub state: RiffState,
    #[serde(default, rename = "userName")]
    pub user_name: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub root: u32,
    #[serde(default)]
    pub scale: u32,
    #[serde(default)]
    pub app_version: i32,
    #[serde(default)]
    pub magnitude: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct RiffState {
    #[serde(default)]
    pub bps: f32,
    #[serde(default, rename = "barLength")]
    pub bar_length: f32,
    #[serde(default = "Vec::new")]
    pub playback: Vec<PlaybackEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackEntry {
    #[serde(default)]
    pub slot: PlaybackSlot,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackSlot {
    #[serde(default)]
    pub current: PlaybackCurrent,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackCurrent {
    #[serde(default)]
    pub on: bool,
    #[serde(default, rename = "currentLoop")]
    pub current_loop: String,
    #[serde(default)]
    pub gain: f32,
}

impl RiffDocument {
    /// Flatten the nested playback state into a warehouse riff row.
    pub fn to_record(&self, jam_id: &JamId) -> RiffRecord {
        let mut record = RiffRecord {
            id: self.id.clone(),
            jam_id: jam_id.clone(),
            creation_time: (self.created / 1000) as i64,
            root: self.root,
            scale: self.scale,
            bps: self.state.bps,
            bpm_rnd: bps_to_rounded_bpm(self.state.bps),
            bar_length: self.state.bar_length as i32,
            app_version: self.app_version,
            magnitude: self.magnitude,
            user: self.user_name.clone(),
            ..RiffRecord::default()
        };

        for (slot, entry) in self.state.playback.iter().take(STEM_SLOTS).enumerate() {
            let current = &entry.slot.current;
            // some saves nulled currentLoop while leaving the slot flagged on
            if current.on && !current.current_loop.is_empty() {
                record.stems[slot] = StemId::new(current.current_loop.clone());
                record.gains[slot] = current.gain;
            }
        }

        record.sync_active_flags();
        record
    }
}

// ── stem documents ─────────────────────────────────────────────────────────

fn default_audio_mime() -> String {
    // very old stems lack MIME data entirely
    "audio/ogg".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioAttachment {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_audio_mime")]
    pub mime: String,
    #[serde(default)]
    pub length: u64,
}

impl AudioAttachment {
    /// Patch the known damage patterns in older attachment records. Returns
    /// false when the record is beyond repair.
    pub fn normalise(&mut self) -> bool {
        // missing key: re-derive from the full URL
        if self.key.is_empty() {
            match self.url.splitn(4, '/').nth(3) {
                Some(path) if !path.is_empty() => {
                    self.key = path.to_owned();
                    log::debug!("repaired missing attachment key from url");
                }
                _ => {
                    log::error!("attachment key unrecoverable from url [{}]", self.url);
                    return false;
                }
            }
        }

        // one upstream batch wrote "https://<bucket>" into the endpoint
        if self.endpoint.starts_with("http") {
            match self.endpoint.rsplit('/').next() {
                Some(host) if !host.is_empty() => {
                    self.endpoint = host.to_owned();
                    log::debug!("repaired scheme-prefixed attachment endpoint");
                }
                _ => {
                    log::error!("attachment endpoint unrecoverable [{}]", self.endpoint);
                    return false;
                }
            }
        }

        // bucket already folded into the endpoint host
        if !self.bucket.is_empty() && self.endpoint.starts_with(&self.bucket) {
            self.bucket.clear();
        }

        !self.endpoint.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CdnAttachments {
    #[serde(default, rename = "oggAudio")]
    pub ogg_audio: Option<AudioAttachment>,
    #[serde(default, rename = "flacAudio")]
    pub flac_audio: Option<AudioAttachment>,
}

impl CdnAttachments {
    /// First available audio format, ogg preferred.
    pub fn preferred(&self) -> Option<&AudioAttachment> {
        self.ogg_audio
            .as_ref()
            .filter(|a| !a.endpoint.is_empty())
            .or(self.flac_audio.as_ref().filter(|a| !a.endpoint.is_empty()))
    }

    pub fn has_audio(&self) -> bool {
        self.preferred().is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct StemDocument {
    #[serde(rename = "_id")]
    pub id: StemId,
    pub cdn_attachments: CdnAttachments,
    #[serde(default)]
    pub bps: f32,
    #[serde(default, rename = "length16ths")]
    pub length_16ths: f32,
    #[serde(default, rename = "originalPitch")]
    pub original_pitch: f32,
    #[serde(default, rename = "barLength")]
    pub bar_length: f32,
    #[serde(default, rename = "presetName")]
    pub preset_name: String,
    #[serde(default, rename = "creatorUserName")]
    pub creator_user_name: String,
    #[serde(default, rename = "primaryColour")]
    pub primary_colour: String,
    /// Float because newer clients save decimal precision
    #[serde(default, rename = "sampleRate")]
    pub sample_rate: f32,
    #[serde(default)]
    pub created: u64,
    #[serde(default, rename = "isDrum")]
    pub is_drum: bool,
    #[serde(default, rename = "isNote")]
    pub is_note: bool,
    #[serde(default, rename = "isBass")]
    pub is_bass: bool,
    #[serde(default, rename = "isMic")]
    pub is_mic: bool,
}

impl StemDocument {
    /// Convert to a warehouse stem row using the first usable audio format.
    pub fn to_record(&self, jam_id: &JamId) -> Option<StemRecord> {
        let mut attachment = self.cdn_attachments.preferred()?.clone();
        if !attachment.normalise() {
            return None;
        }

        Some(StemRecord {
            id: self.id.clone(),
            jam_id: jam_id.clone(),
            creation_time: (self.created / 1000) as i64,
            file_endpoint: attachment.endpoint,
            file_bucket: attachment.bucket,
            file_key: attachment.key,
            file_mime: attachment.mime,
            file_length_bytes: attachment.length,
            bps: self.bps,
            bpm_rnd: bps_to_rounded_bpm(self.bps),
            instrument: InstrumentFlags {
                drum: self.is_drum,
                note: self.is_note,
                bass: self.is_bass,
                mic: self.is_mic,
            },
            length_16ths: self.length_16ths,
            original_pitch: self.original_pitch,
            bar_length: self.bar_length,
            preset: self.preset_name.clone(),
            user: self.creator_user_name.clone(),
            sample_rate: self.sample_rate as u32,
            colour: self.primary_colour.clone(),
        })
    }
}

// ── stem validation documents ──────────────────────────────────────────────

/// Attachment block written by pre-CDN client versions; its presence marks a
/// stem as "old but valid" even without an app version.
#[derive(Debug, Default, Deserialize)]
pub struct VintageAttachments {
    #[serde(default, rename = "oggAudio")]
    pub ogg_audio: Option<VintageAudio>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VintageAudio {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub digest: String,
}

/// Minimal parse of a stem document, just enough to decide whether the id
/// actually refers to an ingestible stem.
#[derive(Debug, Default, Deserialize)]
pub struct TypeCheckDocument {
    #[serde(default, rename = "_id")]
    pub id: StemId,
    #[serde(default, rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub app_version: i32,
    #[serde(default)]
    pub cdn_attachments: CdnAttachments,
    #[serde(default, rename = "_attachments")]
    pub attachments: VintageAttachments,
}

impl TypeCheckDocument {
    /// Vintage stems carry inline attachment metadata instead of versioning.
    pub fn has_vintage_audio(&self) -> bool {
        self.attachments
            .ogg_audio
            .as_ref()
            .is_some_and(|audio| !audio.content_type.is_empty())
    }
}

// ── shared riffs ───────────────────────────────────────────────────────────

/// One entry of the shared-riff listing endpoint: riff metadata plus the
/// full stem documents inlined as `loops`.
#[derive(Debug, Deserialize)]
pub struct SharedRiffEntry {
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub band: String,
    #[serde(default)]
    pub title: String,
    pub rifff: RiffDocument,
    #[serde(default = "Vec::new")]
    pub loops: Vec<StemDocument>,
}

#[derive(Debug, Deserialize)]
pub struct SharedRiffsResponse {
    #[serde(default = "Vec::new")]
    pub data: Vec<SharedRiffEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_riff_document_flattens_slots() {
        let json = r#"{
            "_id": "riff01",
            "state": {
                "bps": 2.0,
                "barLength": 4.0,
                "playback": [
                    { "slot": { "current": { "on": true, "currentLoop": "stem01", "gain": 0.8 } } },
                    { "slot": { "current": { "on": true, "currentLoop": "", "gain": 0.5 } } },
                    { "slot": { "current": { "on": false, "currentLoop": "stem02", "gain": 0.5 } } }
                ]
            },
            "userName": "someone",
            "created": 1650000000000,
            "root": 3,
            "scale": 5
        }"#;

        let doc: RiffDocument = serde_json::from_str(json).unwrap();
        let record = doc.to_record(&JamId::from("band_x"));

        assert_eq!(record.creation_time, 1_650_000_000);
        assert!(record.stems_on[0]);
        assert_eq!(record.gains[0], 0.8);
        // slot flagged on with a nulled loop id must come out inactive
        assert!(!record.stems_on[1]);
        // slot explicitly off stays off even with an id present
        assert!(!record.stems_on[2]);
        assert_eq!(record.bpm_rnd, 120.0);
    }

    #[test]
    fn test_attachment_normalise_repairs_endpoint_and_key() {
        let mut attachment = AudioAttachment {
            bucket: "store0".to_owned(),
            endpoint: "https://store0.region.example.net".to_owned(),
            key: String::new(),
            url: "https://store0.region.example.net/attachments/audio/abc/def".to_owned(),
            mime: "audio/ogg".to_owned(),
            length: 100,
        };

        assert!(attachment.normalise());
        assert_eq!(attachment.endpoint, "store0.region.example.net");
        assert_eq!(attachment.key, "attachments/audio/abc/def");
        // bucket folded into the repaired endpoint is dropped
        assert!(attachment.bucket.is_empty());
    }

    #[test]
    fn test_attachment_preference_ogg_first() {
        let cdn = CdnAttachments {
            ogg_audio: Some(AudioAttachment {
                bucket: String::new(),
                endpoint: "ogg.example.net".into(),
                key: "k1".into(),
                url: String::new(),
                mime: "audio/ogg".into(),
                length: 1,
            }),
            flac_audio: Some(AudioAttachment {
                bucket: String::new(),
                endpoint: "flac.example.net".into(),
                key: "k2".into(),
                url: String::new(),
                mime: "audio/flac".into(),
                length: 1,
            }),
        };
        assert_eq!(cdn.preferred().unwrap().endpoint, "ogg.example.net");
    }

    #[test]
    fn test_type_check_vintage_detection() {
        let json = r#"{
            "_id": "stem09",
            "type": "Loop",
            "_attachments": { "oggAudio": { "content_type": "audio/ogg", "digest": "x" } }
        }"#;
        let doc: TypeCheckDocument = serde_json::from_str(json).unwrap();
        assert!(doc.has_vintage_audio());
        assert_eq!(doc.app_version, 0);
        assert!(!doc.cdn_attachments.has_audio());
    }
}
