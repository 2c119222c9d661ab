//! Playback orchestration.
//!
//! [`MusicService`] ties the pipeline together: provider search and URL
//! resolution, exclusive-output arbitration, then a three-thread session
//! (network/decode producer, audio consumer, lyric poller) around the
//! bounded chunk queue. One session exists at a time; `play_song` tears
//! down the previous session before starting the next, and `stop` is
//! idempotent.
//!
//! Thread roles:
//! - producer: reads compressed chunks, decodes, filters, enqueues.
//!   Skips the read cycle above the high watermark and slows down when
//!   the server trickles while the queue is nearly empty.
//! - consumer: started once pre-roll depth is reached (or at end of a
//!   short stream), drains the queue into the sink.
//! - lyrics: best-effort; fetch failure or empty lyrics disable it
//!   without affecting playback.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};

use crate::arbiter::{ArbitrationToken, AudioArbitration};
use crate::config::MusicConfig;
use crate::decode::{DecodeEngine, Mp3StreamDecoder, SymphoniaEngine};
use crate::display::{DisplayNotifier, DisplayRole};
use crate::fetch::HttpFetcher;
use crate::filter::AdaptiveResampleFilter;
use crate::lyrics::{LyricsSync, parse_lrc};
use crate::queue::PlaybackRingBuffer;
use crate::search::{SearchClient, Track};
use crate::sink::AudioSink;
use crate::transport::HttpTransport;

/// Consecutive hard decode errors before the stream is declared not-MP3.
const DECODE_ERROR_LIMIT: u32 = 3;
/// Consecutive short network reads that trigger the trickle slowdown.
const SMALL_READ_LIMIT: u32 = 5;
const SMALL_READ_BYTES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum PlayerState {
    Idle = 0,
    Searching = 1,
    Resolving = 2,
    Connecting = 3,
    Streaming = 4,
    Stopping = 5,
}

impl PlayerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Searching,
            2 => Self::Resolving,
            3 => Self::Connecting,
            4 => Self::Streaming,
            5 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

pub(crate) type EngineFactory =
    Arc<dyn Fn() -> Result<Box<dyn DecodeEngine>> + Send + Sync>;

/// State shared by the session threads and `stop`.
struct SessionShared {
    interrupt: Arc<AtomicBool>,
    producer_done: AtomicBool,
    consumer_started: AtomicBool,
    queue: PlaybackRingBuffer,
    token: ArbitrationToken,
    sink: Arc<dyn AudioSink>,
    display: Arc<dyn DisplayNotifier>,
    config: MusicConfig,
    state: Arc<AtomicU8>,
    /// Set by the consumer when audible playback begins; the lyric
    /// clock is measured from here.
    playback_start: Mutex<Option<Instant>>,
}

impl SessionShared {
    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }
}

struct Session {
    shared: Arc<SessionShared>,
    fetcher: Arc<HttpFetcher>,
    producer: Option<thread::JoinHandle<()>>,
    consumer: Option<thread::JoinHandle<()>>,
    lyrics: Option<thread::JoinHandle<()>>,
}

pub struct MusicService {
    transport: Arc<dyn HttpTransport>,
    sink: Arc<dyn AudioSink>,
    arbiter: Arc<dyn AudioArbitration>,
    display: Arc<dyn DisplayNotifier>,
    config: MusicConfig,
    state: Arc<AtomicU8>,
    session: Mutex<Option<Session>>,
    /// Serializes whole `play_song` calls so two concurrent callers
    /// cannot both pass teardown and race the session slot.
    play_lock: Mutex<()>,
    engine_factory: EngineFactory,
}

impl MusicService {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn AudioSink>,
        arbiter: Arc<dyn AudioArbitration>,
        display: Arc<dyn DisplayNotifier>,
        config: MusicConfig,
    ) -> Self {
        Self::with_engine_factory(
            transport,
            sink,
            arbiter,
            display,
            config,
            Arc::new(|| Ok(Box::new(SymphoniaEngine::new()?) as Box<dyn DecodeEngine>)),
        )
    }

    pub(crate) fn with_engine_factory(
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn AudioSink>,
        arbiter: Arc<dyn AudioArbitration>,
        display: Arc<dyn DisplayNotifier>,
        config: MusicConfig,
        engine_factory: EngineFactory,
    ) -> Self {
        Self {
            transport,
            sink,
            arbiter,
            display,
            config,
            state: Arc::new(AtomicU8::new(PlayerState::Idle as u8)),
            session: Mutex::new(None),
            play_lock: Mutex::new(()),
            engine_factory,
        }
    }

    pub fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Whether a session exists whose producer is still running.
    pub fn is_active(&self) -> bool {
        let guard = match self.session.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .is_some_and(|s| !s.shared.producer_done.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: PlayerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Search, resolve and start streaming a track. Any current session
    /// is stopped first. Returns the resolved track metadata.
    pub fn play_song(&self, keyword: &str) -> Result<Track> {
        let _play_guard = match self.play_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.stop();

        let interrupt = Arc::new(AtomicBool::new(false));
        let fetcher = Arc::new(HttpFetcher::new(
            self.transport.clone(),
            interrupt.clone(),
            self.config.fetch.clone(),
        ));
        let client = SearchClient::new(&fetcher, &self.config.provider);

        self.set_state(PlayerState::Searching);
        tracing::info!(keyword, "searching");
        self.display
            .set_message(DisplayRole::NowPlaying, &format!("Searching: {keyword}"));
        let (id, title, artist) = match client.query(keyword) {
            Ok(hit) => hit,
            Err(e) => {
                self.display
                    .set_message(DisplayRole::Notice, "Song not found");
                self.set_state(PlayerState::Idle);
                return Err(e.context("song search"));
            }
        };
        self.display
            .set_message(DisplayRole::NowPlaying, &format!("{title} - {artist}"));

        self.set_state(PlayerState::Resolving);
        let source_url = match client.resolve(id) {
            Ok(url) => url,
            Err(e) => {
                self.display
                    .set_message(DisplayRole::Notice, "No playable source");
                self.set_state(PlayerState::Idle);
                return Err(e.context("source resolve"));
            }
        };

        if let Some(ext) = unsupported_extension(&source_url) {
            self.display.set_message(
                DisplayRole::Notice,
                &format!("Unsupported audio format: {ext}"),
            );
            self.set_state(PlayerState::Idle);
            return Err(anyhow!("source is {ext}, only mp3 is supported"));
        }

        let track = Track {
            id,
            title,
            artist,
            source_url,
        };

        let token = match self.acquire_output() {
            Some(token) => token,
            None => {
                self.display
                    .set_message(DisplayRole::Notice, "Audio output busy");
                self.set_state(PlayerState::Idle);
                return Err(anyhow!("audio output arbitration denied"));
            }
        };

        self.set_state(PlayerState::Connecting);
        let engine = match (self.engine_factory)() {
            Ok(engine) => engine,
            Err(e) => {
                self.set_state(PlayerState::Idle);
                return Err(e.context("create decode engine"));
            }
        };

        let shared = Arc::new(SessionShared {
            interrupt: interrupt.clone(),
            producer_done: AtomicBool::new(false),
            consumer_started: AtomicBool::new(false),
            queue: PlaybackRingBuffer::new(self.config.buffer.capacity),
            token,
            sink: self.sink.clone(),
            display: self.display.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            playback_start: Mutex::new(None),
        });

        let producer = {
            let shared = shared.clone();
            let fetcher = fetcher.clone();
            let url = track.source_url.clone();
            thread::Builder::new()
                .name("music-producer".into())
                .spawn(move || run_producer(shared, fetcher, url, engine))
                .context("spawn producer thread")?
        };
        let consumer = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("music-consumer".into())
                .spawn(move || run_consumer(shared))
                .context("spawn consumer thread")?
        };
        let lyrics = {
            let shared = shared.clone();
            let fetcher = fetcher.clone();
            let provider = self.config.provider.clone();
            thread::Builder::new()
                .name("music-lyrics".into())
                .spawn(move || run_lyrics(shared, fetcher, provider, id))
                .context("spawn lyrics thread")?
        };

        self.set_state(PlayerState::Streaming);
        let mut guard = match self.session.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Session {
            shared,
            fetcher,
            producer: Some(producer),
            consumer: Some(consumer),
            lyrics: Some(lyrics),
        });
        Ok(track)
    }

    /// Stop the current session, if any. Safe to call repeatedly and
    /// from any thread; returns once the session threads have exited.
    pub fn stop(&self) {
        let session = {
            let mut guard = match self.session.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some(mut session) = session else {
            self.set_state(PlayerState::Idle);
            return;
        };

        self.set_state(PlayerState::Stopping);
        tracing::info!("stopping playback session");
        session.shared.interrupt.store(true, Ordering::Relaxed);
        session.fetcher.abort();

        // Bounded wait for the producer to notice the interrupt; the
        // join below then completes without blocking on a slow socket.
        for _ in 0..10 {
            if session.shared.producer_done.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let dropped = session.shared.queue.drain();
        if dropped > 0 {
            tracing::debug!(chunks = dropped, "dropped queued audio on stop");
        }
        session.shared.token.release();

        for handle in [
            session.producer.take(),
            session.consumer.take(),
            session.lyrics.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }

        self.sink.enable_output(false);
        self.set_state(PlayerState::Idle);
    }

    fn acquire_output(&self) -> Option<ArbitrationToken> {
        let attempts = self.config.arbitration_attempts.max(1);
        for attempt in 0..attempts {
            if self.arbiter.request_exclusive(&self.config.owner_tag) {
                return Some(ArbitrationToken::new(
                    self.arbiter.clone(),
                    self.config.owner_tag.clone(),
                ));
            }
            tracing::debug!(attempt = attempt + 1, "audio output busy, retrying");
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

impl Drop for MusicService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Known non-MP3 extensions worth rejecting before opening the stream.
fn unsupported_extension(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    for ext in ["m4a", "flac", "aac", "ogg", "opus", "wav", "wma"] {
        if path.ends_with(&format!(".{ext}")) {
            return Some(ext);
        }
    }
    None
}

fn run_producer(
    shared: Arc<SessionShared>,
    fetcher: Arc<HttpFetcher>,
    url: String,
    engine: Box<dyn DecodeEngine>,
) {
    let mut decoder = Mp3StreamDecoder::with_engine(engine);
    let mut filter = AdaptiveResampleFilter::new();
    let buffer_cfg = &shared.config.buffer;
    let preroll = buffer_cfg.effective_preroll();

    let result = (|| -> Result<()> {
        let mut stream = fetcher.open_stream(&url).context("open media stream")?;
        if let Some(content_type) = stream.header("Content-Type") {
            let ct = content_type.to_lowercase();
            if !ct.contains("audio") && !ct.contains("octet-stream") {
                // Keep going; the decode-error threshold is the real gate.
                tracing::warn!(content_type = %content_type, "stream may not be mp3");
            }
        }
        let mut buf = vec![0u8; shared.config.stream_chunk_bytes.max(512)];
        let mut decode_errors = 0u32;
        let mut small_reads = 0u32;

        loop {
            if shared.interrupted() {
                return Ok(());
            }

            // Above the high watermark there is nothing useful to do but
            // let the consumer catch up.
            if shared.queue.len() >= buffer_cfg.high_watermark {
                thread::sleep(Duration::from_millis(20));
                continue;
            }

            let n = match fetcher.read_chunk(stream.as_mut(), &mut buf) {
                Ok(n) => n,
                Err(_) if shared.interrupted() => return Ok(()),
                Err(e) => return Err(e.context("media stream read")),
            };

            if n == 0 {
                // End of stream: flush the decoder, then make sure the
                // consumer runs even if pre-roll was never reached.
                let pcm = decoder.feed(&[], true).unwrap_or_default();
                enqueue_filtered(&shared, &mut filter, &pcm);
                shared.consumer_started.store(true, Ordering::Relaxed);
                tracing::info!("media stream finished");
                return Ok(());
            }

            if n < SMALL_READ_BYTES {
                small_reads += 1;
                if small_reads > SMALL_READ_LIMIT && shared.queue.len() <= buffer_cfg.low_watermark
                {
                    // Server is trickling and we are nearly dry; give it
                    // a moment to accumulate instead of thrashing.
                    thread::sleep(Duration::from_millis(50));
                }
            } else {
                small_reads = 0;
            }

            match decoder.feed(&buf[..n], false) {
                Ok(pcm) => {
                    decode_errors = 0;
                    enqueue_filtered(&shared, &mut filter, &pcm);
                }
                Err(e) => {
                    decode_errors += 1;
                    tracing::warn!(count = decode_errors, "decode error: {e:#}");
                    if decode_errors >= DECODE_ERROR_LIMIT {
                        shared
                            .display
                            .set_message(DisplayRole::Notice, "Unsupported audio format");
                        return Err(e.context("stream is not decodable mp3"));
                    }
                }
            }

            if !shared.consumer_started.load(Ordering::Relaxed) && shared.queue.len() >= preroll {
                tracing::info!(chunks = shared.queue.len(), "pre-roll reached");
                shared.consumer_started.store(true, Ordering::Relaxed);
            }

            thread::sleep(Duration::from_millis(2));
        }
    })();

    if let Err(e) = result {
        if !shared.interrupted() {
            tracing::error!("producer failed: {e:#}");
        }
        // Wake the consumer so it can wind down instead of waiting for
        // a pre-roll that will never come.
        shared.consumer_started.store(true, Ordering::Relaxed);
    }
    shared.producer_done.store(true, Ordering::Relaxed);
    shared.token.release();
}

/// Run the filter over decoded PCM and enqueue the result, retrying a
/// full queue until the chunk fits or the session is interrupted.
fn enqueue_filtered(shared: &SessionShared, filter: &mut AdaptiveResampleFilter, pcm: &[i16]) {
    if pcm.is_empty() {
        return;
    }
    let filtered = filter.process(pcm);
    if filtered.is_empty() {
        return;
    }
    let mut chunk = filtered;
    loop {
        match shared
            .queue
            .try_enqueue(chunk, shared.config.buffer.enqueue_timeout)
        {
            Ok(()) => return,
            Err(returned) => {
                if shared.interrupted() {
                    return;
                }
                chunk = returned;
            }
        }
    }
}

fn run_consumer(shared: Arc<SessionShared>) {
    // Hold playback until the producer signals pre-roll (or gives up).
    while !shared.consumer_started.load(Ordering::Relaxed) {
        if shared.interrupted() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if shared.interrupted() {
        return;
    }

    shared.sink.enable_output(true);
    {
        let mut start = match shared.playback_start.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *start = Some(Instant::now());
    }
    tracing::info!("playback started");

    let mut empty_waits = 0u32;
    let mut last_low_warning: Option<Instant> = None;
    loop {
        if shared.interrupted() {
            break;
        }
        match shared.queue.dequeue(shared.config.buffer.dequeue_timeout) {
            Some(chunk) => {
                empty_waits = 0;
                let mut offset = 0;
                while offset < chunk.len() {
                    if shared.interrupted() {
                        break;
                    }
                    let accepted = shared.sink.write(&chunk[offset..]);
                    offset += accepted;
                    if accepted == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                let depth = shared.queue.len();
                if depth <= shared.config.buffer.low_watermark
                    && !shared.producer_done.load(Ordering::Relaxed)
                    && last_low_warning.is_none_or(|t| t.elapsed() > Duration::from_secs(1))
                {
                    tracing::warn!(chunks = depth, "playback buffer running low");
                    last_low_warning = Some(Instant::now());
                }
                thread::sleep(Duration::from_millis(1));
            }
            None => {
                if shared.producer_done.load(Ordering::Relaxed) && shared.queue.is_empty() {
                    empty_waits += 1;
                    if empty_waits >= 3 {
                        break;
                    }
                } else {
                    empty_waits = 0;
                }
            }
        }
    }

    shared.sink.enable_output(false);
    if !shared.interrupted() {
        tracing::info!("playback finished");
        shared
            .display
            .set_message(DisplayRole::Notice, "Playback finished");
        shared.state.store(PlayerState::Idle as u8, Ordering::Relaxed);
    }
}

fn run_lyrics(
    shared: Arc<SessionShared>,
    fetcher: Arc<HttpFetcher>,
    provider: crate::config::ProviderConfig,
    track_id: i64,
) {
    // Let the playback threads settle before spending a request on
    // lyrics; stay responsive to interrupt throughout.
    for _ in 0..10 {
        if shared.interrupted() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let client = SearchClient::new(&fetcher, &provider);
    let text = match client.fetch_lyrics(track_id) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("no lyrics: {e:#}");
            return;
        }
    };
    let mut sync = LyricsSync::new(parse_lrc(&text));
    if sync.is_empty() {
        return;
    }
    tracing::info!("lyrics loaded");

    let poll = shared.config.lyric_poll_interval;
    while !shared.interrupted() {
        let elapsed = {
            let start = match shared.playback_start.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            start.map(|t| t.elapsed().as_millis() as u64)
        };
        if let Some(elapsed_ms) = elapsed {
            if let Some(line) = sync.tick(elapsed_ms) {
                shared.display.set_message(DisplayRole::Lyrics, &line.text);
            }
        }
        if shared.producer_done.load(Ordering::Relaxed) && shared.queue.is_empty() {
            return;
        }
        // Sleep in short steps so stop() is not held up by the poll.
        let steps = (poll.as_millis() / 100).max(1) as u32;
        for _ in 0..steps {
            if shared.interrupted() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::decode::{EngineStep, StreamParams};
    use crate::transport::{HttpMethod, HttpStream, HttpTransport};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    // --- mocks -----------------------------------------------------------

    struct FixtureStream {
        body: Vec<u8>,
        pos: usize,
    }

    impl HttpStream for FixtureStream {
        fn status(&self) -> u16 {
            200
        }
        fn header(&self, _name: &str) -> Option<String> {
            None
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.body.len() - self.pos);
            buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Never-ending stream, for interrupt tests.
    struct EndlessStream;

    impl HttpStream for EndlessStream {
        fn status(&self) -> u16 {
            200
        }
        fn header(&self, _name: &str) -> Option<String> {
            None
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(0x55);
            Ok(buf.len())
        }
    }

    struct FixtureTransport {
        responses: HashMap<String, Vec<u8>>,
        endless_url: Option<String>,
    }

    impl HttpTransport for FixtureTransport {
        fn open(
            &self,
            url: &str,
            _method: HttpMethod,
            _timeout: Duration,
        ) -> Result<Box<dyn HttpStream>> {
            if self.endless_url.as_deref() == Some(url) {
                return Ok(Box::new(EndlessStream));
            }
            let body = self
                .responses
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow!("no fixture for {url}"))?;
            Ok(Box::new(FixtureStream { body, pos: 0 }))
        }
    }

    /// Engine producing two samples per input byte, consuming everything.
    struct FakeEngine;

    impl DecodeEngine for FakeEngine {
        fn process(&mut self, input: &[u8], _eos: bool, out: &mut [i16]) -> Result<EngineStep> {
            if input.is_empty() {
                return Ok(EngineStep::NeedMoreInput);
            }
            let decoded = input.len() * 2;
            if decoded > out.len() {
                return Ok(EngineStep::NeedLargerBuffer { needed: decoded });
            }
            for (i, slot) in out[..decoded].iter_mut().enumerate() {
                *slot = if i % 2 == 0 { 1000 } else { -1000 };
            }
            Ok(EngineStep::Output {
                consumed: input.len(),
                decoded,
            })
        }
        fn params(&self) -> Option<StreamParams> {
            Some(StreamParams {
                sample_rate: 44_100,
                channels: 2,
                bits_per_sample: 16,
            })
        }
    }

    struct FailingEngine;

    impl DecodeEngine for FailingEngine {
        fn process(&mut self, _input: &[u8], _eos: bool, _out: &mut [i16]) -> Result<EngineStep> {
            Err(anyhow!("sync not found"))
        }
        fn params(&self) -> Option<StreamParams> {
            None
        }
    }

    /// Fails the first N feeds, then decodes like [`FakeEngine`].
    struct FlakyEngine {
        failures_left: u32,
        inner: FakeEngine,
    }

    impl DecodeEngine for FlakyEngine {
        fn process(&mut self, input: &[u8], eos: bool, out: &mut [i16]) -> Result<EngineStep> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(anyhow!("bad frame"));
            }
            self.inner.process(input, eos, out)
        }
        fn params(&self) -> Option<StreamParams> {
            self.inner.params()
        }
    }

    #[derive(Default)]
    struct MockSink {
        written: AtomicUsize,
        enables: Mutex<Vec<bool>>,
    }

    impl AudioSink for MockSink {
        fn enable_output(&self, enabled: bool) {
            self.enables.lock().unwrap().push(enabled);
        }
        fn write(&self, samples: &[i16]) -> usize {
            self.written.fetch_add(samples.len(), Ordering::Relaxed);
            samples.len()
        }
    }

    #[derive(Default)]
    struct CountingArbiter {
        deny: bool,
        grants: AtomicUsize,
        releases: AtomicUsize,
    }

    impl AudioArbitration for CountingArbiter {
        fn request_exclusive(&self, _owner: &str) -> bool {
            if self.deny {
                return false;
            }
            self.grants.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn release(&self, _owner: &str) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingDisplay {
        messages: Mutex<Vec<(DisplayRole, String)>>,
    }

    impl DisplayNotifier for RecordingDisplay {
        fn set_message(&self, role: DisplayRole, text: &str) {
            self.messages.lock().unwrap().push((role, text.to_string()));
        }
    }

    impl RecordingDisplay {
        fn has_notice_containing(&self, needle: &str) -> bool {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .any(|(role, text)| *role == DisplayRole::Notice && text.contains(needle))
        }
    }

    // --- fixtures --------------------------------------------------------

    const SEARCH_URL: &str = "http://api/search?q=test";
    const RESOLVE_URL: &str = "http://api/url?id=42";
    const LYRIC_URL: &str = "http://api/lyric?id=42";
    const MEDIA_URL: &str = "http://cdn/track.mp3";

    fn provider_fixtures(media_url: &str) -> HashMap<String, Vec<u8>> {
        let mut responses = HashMap::new();
        responses.insert(
            SEARCH_URL.to_string(),
            br#"[{"id":42,"name":"Song","artist":"Band"}]"#.to_vec(),
        );
        responses.insert(
            RESOLVE_URL.to_string(),
            format!(r#"{{"url":"{media_url}"}}"#).into_bytes(),
        );
        responses.insert(
            LYRIC_URL.to_string(),
            br#"{"lyric":"[00:00.10]hello"}"#.to_vec(),
        );
        responses
    }

    fn test_config() -> MusicConfig {
        MusicConfig {
            provider: crate::config::ProviderConfig {
                search_url: "http://api/search?q={keyword}".into(),
                resolve_url: "http://api/url?id={id}".into(),
                lyrics_url: "http://api/lyric?id={id}".into(),
                fields: Default::default(),
            },
            buffer: BufferConfig {
                capacity: 32,
                high_watermark: 25,
                low_watermark: 5,
                preroll_chunks: 50,
                enqueue_timeout: Duration::from_millis(20),
                dequeue_timeout: Duration::from_millis(20),
            },
            stream_chunk_bytes: 4096,
            arbitration_attempts: 3,
            lyric_poll_interval: Duration::from_millis(100),
            ..MusicConfig::default()
        }
    }

    struct Harness {
        service: MusicService,
        sink: Arc<MockSink>,
        arbiter: Arc<CountingArbiter>,
        display: Arc<RecordingDisplay>,
    }

    fn init_test_logging() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    fn harness(
        transport: FixtureTransport,
        arbiter: CountingArbiter,
        engine_factory: EngineFactory,
    ) -> Harness {
        init_test_logging();
        let sink = Arc::new(MockSink::default());
        let arbiter = Arc::new(arbiter);
        let display = Arc::new(RecordingDisplay::default());
        let service = MusicService::with_engine_factory(
            Arc::new(transport),
            sink.clone(),
            arbiter.clone(),
            display.clone(),
            test_config(),
            engine_factory,
        );
        Harness {
            service,
            sink,
            arbiter,
            display,
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    // --- tests -----------------------------------------------------------

    #[test]
    fn plays_stream_end_to_end() {
        let media_bytes = 50_000usize;
        let mut responses = provider_fixtures(MEDIA_URL);
        responses.insert(MEDIA_URL.to_string(), vec![0u8; media_bytes]);
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        let track = h.service.play_song("test").unwrap();
        assert_eq!(track.id, 42);
        assert_eq!(track.title, "Song");

        // Producer finishes and releases the output on its own.
        assert!(wait_until(Duration::from_secs(5), || {
            h.arbiter.releases.load(Ordering::SeqCst) == 1
        }));
        // Consumer drains the rest of the queue.
        assert!(wait_until(Duration::from_secs(5), || {
            !h.service.is_active()
        }));
        thread::sleep(Duration::from_millis(200));

        // 2 samples per byte through the ~2/7 filter.
        let expected = media_bytes * 2 * 2 / 7;
        let written = h.sink.written.load(Ordering::Relaxed);
        assert!(
            written.abs_diff(expected) < expected / 5,
            "wrote {written}, expected ~{expected}"
        );

        let enables = h.sink.enables.lock().unwrap().clone();
        assert!(enables.contains(&true));
        assert_eq!(enables.last(), Some(&false));

        let messages = h.display.messages.lock().unwrap();
        assert!(
            messages
                .iter()
                .any(|(role, text)| *role == DisplayRole::NowPlaying && text == "Song - Band")
        );
        drop(messages);

        h.service.stop();
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);
        assert_eq!(h.service.state(), PlayerState::Idle);
    }

    #[test]
    fn stop_interrupts_live_stream() {
        let h = harness(
            FixtureTransport {
                responses: provider_fixtures(MEDIA_URL),
                endless_url: Some(MEDIA_URL.to_string()),
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        h.service.play_song("test").unwrap();
        assert_eq!(h.service.state(), PlayerState::Streaming);
        thread::sleep(Duration::from_millis(150));

        let begun = Instant::now();
        h.service.stop();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(h.service.state(), PlayerState::Idle);
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);

        // Second stop is a no-op.
        h.service.stop();
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undecodable_stream_reports_unsupported_format() {
        let mut responses = provider_fixtures(MEDIA_URL);
        responses.insert(MEDIA_URL.to_string(), vec![0u8; 64 * 1024]);
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FailingEngine) as Box<dyn DecodeEngine>)),
        );

        h.service.play_song("test").unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            h.display.has_notice_containing("Unsupported")
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            h.arbiter.releases.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(h.sink.written.load(Ordering::Relaxed), 0);
        h.service.stop();
    }

    #[test]
    fn decode_error_counter_resets_on_success() {
        let media_bytes = 50_000usize;
        let mut responses = provider_fixtures(MEDIA_URL);
        responses.insert(MEDIA_URL.to_string(), vec![0u8; media_bytes]);
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            // Two failures are below the threshold; the first success
            // must reset the counter and keep the session alive.
            Arc::new(|| {
                Ok(Box::new(FlakyEngine {
                    failures_left: 2,
                    inner: FakeEngine,
                }) as Box<dyn DecodeEngine>)
            }),
        );

        h.service.play_song("test").unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            h.arbiter.releases.load(Ordering::SeqCst) == 1
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            !h.service.is_active()
        }));
        thread::sleep(Duration::from_millis(200));

        assert!(!h.display.has_notice_containing("Unsupported"));
        // The two failed feeds drop their chunks; the rest plays.
        let expected = (media_bytes - 2 * 4096) * 2 * 2 / 7;
        let written = h.sink.written.load(Ordering::Relaxed);
        assert!(
            written.abs_diff(expected) < expected / 5,
            "wrote {written}, expected ~{expected}"
        );
        h.service.stop();
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_play_requests_serialize() {
        let h = harness(
            FixtureTransport {
                responses: provider_fixtures(MEDIA_URL),
                endless_url: Some(MEDIA_URL.to_string()),
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    h.service.play_song("test").unwrap();
                });
            }
        });

        // The calls serialized: the second stopped the first session,
        // leaving exactly one holding the output.
        assert_eq!(h.arbiter.grants.load(Ordering::SeqCst), 2);
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);
        assert!(h.service.is_active());
        h.service.stop();
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_non_mp3_source_before_streaming() {
        let mut responses = provider_fixtures("http://cdn/track.flac");
        responses.insert("http://cdn/track.flac".to_string(), vec![0u8; 16]);
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        assert!(h.service.play_song("test").is_err());
        assert_eq!(h.service.state(), PlayerState::Idle);
        // Rejected before arbitration.
        assert_eq!(h.arbiter.grants.load(Ordering::SeqCst), 0);
        assert!(h.display.has_notice_containing("Unsupported"));
    }

    #[test]
    fn denied_arbitration_fails_playback() {
        let h = harness(
            FixtureTransport {
                responses: provider_fixtures(MEDIA_URL),
                endless_url: None,
            },
            CountingArbiter {
                deny: true,
                ..CountingArbiter::default()
            },
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        assert!(h.service.play_song("test").is_err());
        assert_eq!(h.service.state(), PlayerState::Idle);
        assert!(h.display.has_notice_containing("busy"));
    }

    #[test]
    fn failed_search_returns_to_idle() {
        let mut responses = HashMap::new();
        responses.insert(SEARCH_URL.to_string(), b"[]".to_vec());
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        assert!(h.service.play_song("test").is_err());
        assert_eq!(h.service.state(), PlayerState::Idle);
        assert!(h.display.has_notice_containing("not found"));
    }

    #[test]
    fn lyric_lines_reach_the_display() {
        let media_bytes = 900_000usize;
        let mut responses = provider_fixtures(MEDIA_URL);
        responses.insert(MEDIA_URL.to_string(), vec![0u8; media_bytes]);
        let h = harness(
            FixtureTransport {
                responses,
                endless_url: None,
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        h.service.play_song("test").unwrap();
        // The lyric thread waits ~1s before fetching; the first line is
        // timestamped 100ms so it should appear soon after.
        assert!(wait_until(Duration::from_secs(5), || {
            h.display
                .messages
                .lock()
                .unwrap()
                .iter()
                .any(|(role, text)| *role == DisplayRole::Lyrics && text == "hello")
        }));
        h.service.stop();
    }

    #[test]
    fn new_play_replaces_previous_session() {
        let h = harness(
            FixtureTransport {
                responses: provider_fixtures(MEDIA_URL),
                endless_url: Some(MEDIA_URL.to_string()),
            },
            CountingArbiter::default(),
            Arc::new(|| Ok(Box::new(FakeEngine) as Box<dyn DecodeEngine>)),
        );

        h.service.play_song("test").unwrap();
        thread::sleep(Duration::from_millis(100));
        h.service.play_song("test").unwrap();
        assert_eq!(h.service.state(), PlayerState::Streaming);
        // First session released once; second still holds the output.
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 1);
        assert_eq!(h.arbiter.grants.load(Ordering::SeqCst), 2);
        h.service.stop();
        assert_eq!(h.arbiter.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsupported_extension_detection() {
        assert_eq!(unsupported_extension("http://cdn/a.flac"), Some("flac"));
        assert_eq!(unsupported_extension("http://cdn/a.M4A?sig=x"), Some("m4a"));
        assert_eq!(unsupported_extension("http://cdn/a.mp3"), None);
        assert_eq!(unsupported_extension("http://cdn/a.mp3?session=9"), None);
        assert_eq!(unsupported_extension("http://cdn/stream"), None);
    }
}
