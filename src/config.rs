//! Configuration types for the streaming playback pipeline.

use std::time::Duration;

/// Thresholds for the bounded chunk queue between the network/decode
/// stage and the audio output stage.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Queue capacity in chunks, fixed for the lifetime of a session.
    pub capacity: usize,
    /// Producer skips the read/decode cycle while the queue holds at
    /// least this many chunks.
    pub high_watermark: usize,
    /// Below this depth the consumer logs a warning (soft signal only).
    pub low_watermark: usize,
    /// Chunks to accumulate before the consumer is started. Clamped to
    /// half the capacity so pre-roll stays reachable under the
    /// high-watermark policy.
    pub preroll_chunks: usize,
    /// Producer-side enqueue timeout.
    pub enqueue_timeout: Duration,
    /// Consumer-side dequeue timeout.
    pub dequeue_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            high_watermark: 25,
            low_watermark: 5,
            preroll_chunks: 50,
            enqueue_timeout: Duration::from_millis(100),
            dequeue_timeout: Duration::from_millis(100),
        }
    }
}

impl BufferConfig {
    /// Effective pre-roll depth for this queue size.
    pub fn effective_preroll(&self) -> usize {
        self.preroll_chunks.min(self.capacity / 2)
    }
}

/// HTTP behaviour for both bounded metadata requests and the long-lived
/// stream read.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Per-request timeout for bounded metadata calls.
    pub request_timeout: Duration,
    /// Timeout for the streaming media connection.
    pub stream_timeout: Duration,
    /// Connection-open attempts for bounded requests (first try included).
    pub open_attempts: u32,
    /// Cap on a buffered response body.
    pub max_response_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(30),
            open_attempts: 3,
            max_response_bytes: 8 * 1024,
        }
    }
}

/// Which JSON fields carry track metadata in provider responses.
///
/// The provider schema is owned by a third-party service; field names are
/// configuration, not invariants.
#[derive(Clone, Debug)]
pub struct ProviderFields {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub url: String,
    pub lyric: String,
    pub lyric_fallback: String,
}

impl Default for ProviderFields {
    fn default() -> Self {
        Self {
            id: "id".into(),
            title: "name".into(),
            artist: "artist".into(),
            url: "url".into(),
            lyric: "lyric".into(),
            lyric_fallback: "lrc".into(),
        }
    }
}

/// Provider endpoints. `{keyword}` and `{id}` placeholders are substituted
/// at request time.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub search_url: String,
    pub resolve_url: String,
    pub lyrics_url: String,
    pub fields: ProviderFields,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            search_url:
                "https://music-api.gdstudio.xyz/api.php?types=search&source=kuwo&count=10&pages=1&name={keyword}"
                    .into(),
            resolve_url:
                "https://music-api.gdstudio.xyz/api.php?types=url&source=kuwo&id={id}&br=320"
                    .into(),
            lyrics_url:
                "https://music-api.gdstudio.xyz/api.php?types=lyric&source=kuwo&id={id}".into(),
            fields: ProviderFields::default(),
        }
    }
}

/// Top-level service configuration.
#[derive(Clone, Debug)]
pub struct MusicConfig {
    pub provider: ProviderConfig,
    pub buffer: BufferConfig,
    pub fetch: FetchConfig,
    /// Compressed bytes pulled from the network per read.
    pub stream_chunk_bytes: usize,
    /// Owner tag presented to the audio arbitration collaborator.
    pub owner_tag: String,
    /// Attempts to acquire the audio token before giving up.
    pub arbitration_attempts: u32,
    /// Poll interval for the lyric cursor.
    pub lyric_poll_interval: Duration,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            buffer: BufferConfig::default(),
            fetch: FetchConfig::default(),
            stream_chunk_bytes: 4096,
            owner_tag: "music".into(),
            arbitration_attempts: 3,
            lyric_poll_interval: Duration::from_millis(500),
        }
    }
}
