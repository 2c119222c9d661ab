//! Incremental MP3 stream decoding.
//!
//! The network producer feeds arbitrary-sized compressed chunks; this
//! module turns them into interleaved `i16` PCM using Symphonia's MP3
//! codec. Because the bytes arrive without container framing, a small
//! frame scanner locates MPEG-audio frame boundaries (and skips a leading
//! ID3v2 tag) so whole frames can be handed to the codec as packets.
//!
//! The engine contract mirrors a push decoder: each call either produces
//! output with a consumed-byte count, asks the caller to grow its output
//! buffer and retry the same input, asks for more input, or fails hard.
//! Hard failures are counted by the caller; three in a row on one stream
//! mean the content is not MP3 at all.

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_MP3, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

/// Stream parameters latched from the first successfully decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: usize,
    pub bits_per_sample: u32,
}

/// One step of the underlying decode engine.
#[derive(Debug)]
pub(crate) enum EngineStep {
    /// `decoded` samples were written to the output buffer and `consumed`
    /// input bytes were used.
    Output { consumed: usize, decoded: usize },
    /// The output buffer cannot hold the pending frame; grow to at least
    /// `needed` samples and call again with the same input.
    NeedLargerBuffer { needed: usize },
    /// The input does not yet contain a complete frame.
    NeedMoreInput,
}

pub(crate) trait DecodeEngine: Send {
    fn process(&mut self, input: &[u8], eos: bool, out: &mut [i16]) -> Result<EngineStep>;
    fn params(&self) -> Option<StreamParams>;
}

/// Incremental decoder over a [`DecodeEngine`].
///
/// Owns the growable input and output buffers; input bytes left over from
/// a partial trailing frame are retained across feeds.
pub struct Mp3StreamDecoder {
    engine: Box<dyn DecodeEngine>,
    input: Vec<u8>,
    output: Vec<i16>,
    params: Option<StreamParams>,
}

const INITIAL_INPUT_CAPACITY: usize = 4096;
const INITIAL_OUTPUT_SAMPLES: usize = 4096;

impl Mp3StreamDecoder {
    pub fn new() -> Result<Self> {
        Ok(Self::with_engine(Box::new(SymphoniaEngine::new()?)))
    }

    pub(crate) fn with_engine(engine: Box<dyn DecodeEngine>) -> Self {
        Self {
            engine,
            input: Vec::with_capacity(INITIAL_INPUT_CAPACITY),
            output: vec![0; INITIAL_OUTPUT_SAMPLES],
            params: None,
        }
    }

    /// Stream parameters, available after the first decoded frame.
    pub fn params(&self) -> Option<StreamParams> {
        self.params
    }

    /// Feed one compressed chunk and collect whatever PCM decodes from it.
    ///
    /// With `end_of_stream` set the engine drains remaining whole frames;
    /// a final partial frame is discarded. A hard decode error drops the
    /// buffered input so the next feed starts clean, and is returned for
    /// the caller to count.
    pub fn feed(&mut self, bytes: &[u8], end_of_stream: bool) -> Result<Vec<i16>> {
        self.input.extend_from_slice(bytes);
        let mut pcm = Vec::new();

        while !self.input.is_empty() {
            let step = match self.engine.process(&self.input, end_of_stream, &mut self.output) {
                Ok(step) => step,
                Err(e) => {
                    self.input.clear();
                    return Err(e);
                }
            };
            match step {
                EngineStep::NeedMoreInput => break,
                EngineStep::NeedLargerBuffer { needed } => {
                    let grown = needed.max(self.output.len() * 2);
                    tracing::warn!(
                        from = self.output.len(),
                        to = grown,
                        "growing decode output buffer"
                    );
                    self.output.resize(grown, 0);
                }
                EngineStep::Output { consumed, decoded } => {
                    if decoded > 0 && self.params.is_none() {
                        self.params = self.engine.params();
                        if let Some(p) = self.params {
                            tracing::info!(
                                rate_hz = p.sample_rate,
                                channels = p.channels,
                                bits = p.bits_per_sample,
                                "stream parameters latched"
                            );
                        }
                    }
                    pcm.extend_from_slice(&self.output[..decoded]);
                    self.input.drain(..consumed);
                    if consumed == 0 && decoded == 0 {
                        break;
                    }
                }
            }
        }

        if end_of_stream {
            // Whatever is left cannot form a whole frame.
            self.input.clear();
        }
        Ok(pcm)
    }
}

/// Production engine: frame scanner + Symphonia MP3 packet decoder.
pub(crate) struct SymphoniaEngine {
    decoder: Box<dyn Decoder>,
    params: Option<StreamParams>,
    /// Decoded samples waiting for a large enough caller buffer.
    pending: Vec<i16>,
    pending_consumed: usize,
    /// Bytes of a leading ID3v2 tag still to be skipped.
    id3_remaining: usize,
    id3_checked: bool,
}

impl SymphoniaEngine {
    pub(crate) fn new() -> Result<Self> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create mp3 decoder")?;
        Ok(Self {
            decoder,
            params: None,
            pending: Vec::new(),
            pending_consumed: 0,
            id3_remaining: 0,
            id3_checked: false,
        })
    }

    fn flush_pending(&mut self, out: &mut [i16]) -> EngineStep {
        if out.len() < self.pending.len() {
            return EngineStep::NeedLargerBuffer {
                needed: self.pending.len(),
            };
        }
        out[..self.pending.len()].copy_from_slice(&self.pending);
        let decoded = self.pending.len();
        let consumed = self.pending_consumed;
        self.pending.clear();
        self.pending_consumed = 0;
        EngineStep::Output { consumed, decoded }
    }
}

impl DecodeEngine for SymphoniaEngine {
    fn process(&mut self, input: &[u8], eos: bool, out: &mut [i16]) -> Result<EngineStep> {
        if !self.pending.is_empty() {
            return Ok(self.flush_pending(out));
        }

        if !self.id3_checked {
            match id3v2_size(input) {
                Id3Scan::NeedMore => return Ok(EngineStep::NeedMoreInput),
                Id3Scan::Tag(size) => {
                    tracing::debug!(bytes = size, "skipping id3v2 tag");
                    self.id3_remaining = size;
                    self.id3_checked = true;
                }
                Id3Scan::None => self.id3_checked = true,
            }
        }
        if self.id3_remaining > 0 {
            let consumed = self.id3_remaining.min(input.len());
            self.id3_remaining -= consumed;
            return Ok(EngineStep::Output {
                consumed,
                decoded: 0,
            });
        }

        let (offset, frame_len) = match scan_frame(input) {
            FrameScan::Frame { offset, frame_len } => (offset, frame_len),
            FrameScan::SkipPrefix(n) => {
                return Ok(EngineStep::Output {
                    consumed: n,
                    decoded: 0,
                });
            }
            FrameScan::NeedMore => {
                if eos || input.len() > 4096 {
                    // A full scan window with no frame sync: not MP3 data.
                    return Err(anyhow!("no mp3 frame sync in {} bytes", input.len()));
                }
                return Ok(EngineStep::NeedMoreInput);
            }
        };

        let packet = Packet::new_from_slice(0, 0, 0, &input[offset..offset + frame_len]);
        // The decoded buffer borrows the decoder, so samples are copied
        // out before any other state is touched.
        let (spec, sample_buf) = {
            let decoded = self
                .decoder
                .decode(&packet)
                .map_err(|e| anyhow!("mp3 frame decode: {e}"))?;
            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<i16>::new(decoded.frames() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            (spec, sample_buf)
        };

        if self.params.is_none() {
            self.params = Some(StreamParams {
                sample_rate: spec.rate,
                channels: spec.channels.count(),
                bits_per_sample: 16,
            });
        }

        self.pending.clear();
        self.pending.extend_from_slice(sample_buf.samples());
        self.pending_consumed = offset + frame_len;
        Ok(self.flush_pending(out))
    }

    fn params(&self) -> Option<StreamParams> {
        self.params
    }
}

enum Id3Scan {
    None,
    NeedMore,
    Tag(usize),
}

/// Detect an ID3v2 tag at the start of the stream.
fn id3v2_size(input: &[u8]) -> Id3Scan {
    if input.len() < 3 {
        return Id3Scan::NeedMore;
    }
    if &input[..3] != b"ID3" {
        return Id3Scan::None;
    }
    if input.len() < 10 {
        return Id3Scan::NeedMore;
    }
    // Synchsafe 28-bit size, excluding the 10-byte header.
    let size = ((input[6] as usize & 0x7F) << 21)
        | ((input[7] as usize & 0x7F) << 14)
        | ((input[8] as usize & 0x7F) << 7)
        | (input[9] as usize & 0x7F);
    Id3Scan::Tag(size + 10)
}

#[derive(Debug, PartialEq, Eq)]
enum FrameScan {
    /// A complete frame is available at `offset`.
    Frame { offset: usize, frame_len: usize },
    /// The first `n` bytes cannot start a frame; consume and rescan.
    SkipPrefix(usize),
    /// A frame may start near the end of the buffer; wait for more bytes.
    NeedMore,
}

/// Locate the next complete MPEG-audio frame in `input`.
fn scan_frame(input: &[u8]) -> FrameScan {
    if input.len() < 4 {
        return FrameScan::NeedMore;
    }
    for offset in 0..input.len() - 3 {
        let header = [
            input[offset],
            input[offset + 1],
            input[offset + 2],
            input[offset + 3],
        ];
        let Some(frame_len) = frame_length(&header) else {
            continue;
        };
        if offset + frame_len > input.len() {
            // Candidate frame extends past the buffer. Flush any garbage
            // prefix so the retained bytes start at the sync word.
            return if offset > 0 {
                FrameScan::SkipPrefix(offset)
            } else {
                FrameScan::NeedMore
            };
        }
        // Guard against false sync: the next frame (when visible) must
        // also start with a sync word.
        let next = offset + frame_len;
        if next + 1 < input.len()
            && !(input[next] == 0xFF && input[next + 1] & 0xE0 == 0xE0)
            && &input[next..(next + 3).min(input.len())] != b"TAG".as_slice()
        {
            continue;
        }
        return FrameScan::Frame { offset, frame_len };
    }
    FrameScan::NeedMore
}

const BITRATES_V1_L3: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const BITRATES_V2_L3: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

/// Frame length in bytes for a Layer III header, or `None` if the four
/// bytes are not a valid header.
fn frame_length(header: &[u8; 4]) -> Option<usize> {
    if header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version = (header[1] >> 3) & 0x3; // 0=2.5, 2=2, 3=1
    let layer = (header[1] >> 1) & 0x3; // 1 = Layer III
    if version == 1 || layer != 1 {
        return None;
    }
    let bitrate_idx = (header[2] >> 4) as usize;
    let samplerate_idx = ((header[2] >> 2) & 0x3) as usize;
    let padding = ((header[2] >> 1) & 0x1) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 || samplerate_idx == 3 {
        return None;
    }

    let (bitrate_kbps, sample_rate, coefficient) = match version {
        3 => (
            BITRATES_V1_L3[bitrate_idx],
            [44_100u32, 48_000, 32_000][samplerate_idx],
            144,
        ),
        2 => (
            BITRATES_V2_L3[bitrate_idx],
            [22_050u32, 24_000, 16_000][samplerate_idx],
            72,
        ),
        _ => (
            BITRATES_V2_L3[bitrate_idx],
            [11_025u32, 12_000, 8_000][samplerate_idx],
            72,
        ),
    };

    Some((coefficient * bitrate_kbps * 1000 / sample_rate) as usize + padding)
}
