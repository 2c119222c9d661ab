//! Streaming music playback pipeline.
//!
//! Searches a third-party provider for a track, streams the MP3 over
//! HTTP, decodes and filters it incrementally, and plays it through an
//! exclusive audio output, with time-synchronized lyrics on the side.
//! [`service::MusicService`] is the entry point; the hardware, display
//! and arbitration collaborators are traits so hosts can supply their
//! own.

pub mod arbiter;
pub mod config;
pub mod display;
pub mod fetch;
pub mod filter;
pub mod lyrics;
pub mod queue;
pub mod search;
pub mod service;
pub mod sink;
pub mod transport;

mod decode;

pub use decode::{Mp3StreamDecoder, StreamParams};
pub use service::{MusicService, PlayerState};
