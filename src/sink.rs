//! Audio output stage.
//!
//! [`AudioSink`] is the seam between the playback pipeline and the output
//! hardware; the orchestrator only ever talks to the trait, which keeps
//! the pipeline testable without a device. [`CpalSink`] is the real
//! implementation: a CPAL output stream fed from a bounded sample buffer.
//!
//! The CPAL stream handle is not `Send`, so the sink spawns a dedicated
//! thread that builds and owns the stream; writers only touch the shared
//! buffer. While output is disabled the callback emits silence without
//! draining the buffer, which is how the preroll phase accumulates audio
//! before playback starts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

pub trait AudioSink: Send + Sync {
    /// Gate actual audible output. Disabled output plays silence and
    /// leaves buffered samples in place.
    fn enable_output(&self, enabled: bool);

    /// Queue interleaved samples for playback. Returns how many were
    /// accepted; the rest must be retried once the device drains.
    fn write(&self, samples: &[i16]) -> usize;
}

/// Buffer shared between writers and the device callback.
struct SinkShared {
    buffer: Mutex<VecDeque<i16>>,
    enabled: AtomicBool,
    max_buffered: usize,
}

impl SinkShared {
    fn new(max_buffered: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(max_buffered.min(1 << 16))),
            enabled: AtomicBool::new(false),
            max_buffered,
        }
    }

    fn accept(&self, samples: &[i16]) -> usize {
        let mut buffer = match self.buffer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let space = self.max_buffered.saturating_sub(buffer.len());
        let n = samples.len().min(space);
        buffer.extend(&samples[..n]);
        n
    }

    /// Fill one callback buffer. Underruns and disabled output both pad
    /// with silence; only enabled output consumes samples.
    fn fill<T>(&self, data: &mut [T])
    where
        T: cpal::Sample + cpal::FromSample<i16>,
    {
        let silence = T::from_sample(0i16);
        if !self.enabled.load(Ordering::Relaxed) {
            data.fill(silence);
            return;
        }
        let mut buffer = match self.buffer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in data.iter_mut() {
            *slot = match buffer.pop_front() {
                Some(s) => T::from_sample(s),
                None => silence,
            };
        }
    }
}

pub struct CpalSink {
    shared: Arc<SinkShared>,
    shutdown: mpsc::Sender<()>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    /// Open the default output device at the given stream parameters.
    ///
    /// `max_buffered` bounds the device-side sample buffer so a stalled
    /// device cannot grow memory without limit.
    pub fn open(sample_rate: u32, channels: usize, max_buffered: usize) -> Result<Self> {
        let shared = Arc::new(SinkShared::new(max_buffered.max(1)));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let shared_cb = shared.clone();
        let worker = thread::Builder::new()
            .name("audio-sink".into())
            .spawn(move || {
                match build_stream(sample_rate, channels, shared_cb) {
                    Ok(stream) => {
                        if ready_tx.send(Ok(())).is_err() {
                            return;
                        }
                        // Keep the stream alive until shutdown; the handle
                        // must stay on this thread.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("spawn audio sink thread")?;

        ready_rx
            .recv()
            .context("audio sink thread exited before reporting")??;

        Ok(Self {
            shared,
            shutdown: shutdown_tx,
            worker: Some(worker),
        })
    }
}

impl AudioSink for CpalSink {
    fn enable_output(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    fn write(&self, samples: &[i16]) -> usize {
        self.shared.accept(samples)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.enabled.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_stream(
    sample_rate: u32,
    channels: usize,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))?;
    let default_config = device
        .default_output_config()
        .context("default output config")?;

    let config = cpal::StreamConfig {
        channels: channels as cpal::ChannelCount,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::info!(
        rate_hz = sample_rate,
        channels,
        format = ?default_config.sample_format(),
        "opening output stream"
    );

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => open_typed::<f32>(&device, &config, shared)?,
        cpal::SampleFormat::I16 => open_typed::<i16>(&device, &config, shared)?,
        cpal::SampleFormat::I32 => open_typed::<i32>(&device, &config, shared)?,
        cpal::SampleFormat::U16 => open_typed::<u16>(&device, &config, shared)?,
        other => return Err(anyhow!("unsupported sample format: {other:?}")),
    };
    stream.play().context("start output stream")?;
    Ok(stream)
}

fn open_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let err_fn = |err| tracing::warn!("output stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| shared.fill(data),
        err_fn,
        None,
    )?;
    Ok(stream)
}
