//! Core playback runtime for the Weft suite
//!
//! Everything that touches live audio lives here: the stem store and its
//! on-disk cache, the live riff loader, the riff request pipeline, the
//! preview mixer and the OPUS broadcast encoder. Persistence and scraping
//! live in `weft-warehouse`, which depends on the domain model declared in
//! this crate.

pub mod broadcast;
pub mod cache;
pub mod gc;
pub mod mixer;
pub mod model;
pub mod pipeline;
pub mod riff;
pub mod stem;
pub mod types;

pub use cache::{StemCache, StemHandle};
pub use mixer::{PreviewMixer, PreviewController, TransitionSpan};
pub use model::{FetchPolicy, JamId, RiffComplete, RiffId, RiffRecord, StemId, StemRecord};
pub use pipeline::{RiffPipeline, RiffRequest};
pub use riff::{LiveRiff, RiffHandle, RiffTiming};
pub use stem::{LiveStem, StemState};
