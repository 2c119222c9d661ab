//! Cancellable HTTP fetching.
//!
//! Two access patterns over the [`HttpTransport`] seam:
//! - [`HttpFetcher::fetch_buffered`]: short-lived bounded requests for
//!   search/metadata/lyrics JSON, with open retries and a
//!   read-until-quiescent body loop that tolerates slow trickling servers.
//! - [`HttpFetcher::open_stream`] + [`HttpFetcher::read_chunk`]: the
//!   long-lived media body read used by the producer task.
//!
//! Every blocking boundary checks the shared cancel flag. A cancel also
//! bumps the request generation so a request that was in flight when the
//! session was torn down cannot report a stale result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::config::FetchConfig;
use crate::transport::{HttpMethod, HttpStream, HttpTransport};

pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    cancel: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cancel: Arc<AtomicBool>,
        config: FetchConfig,
    ) -> Self {
        Self {
            transport,
            cancel,
            generation: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Abort any in-flight request. The owning side stays usable; only
    /// results from requests started before the abort are discarded.
    pub fn abort(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn stale(&self, my_generation: u64) -> bool {
        self.generation.load(Ordering::Relaxed) != my_generation
    }

    /// Perform a bounded GET and buffer the whole response body.
    ///
    /// Connection-open failures are retried with a short backoff. Once the
    /// body is open, reading keeps going while bytes arrive; after any data
    /// has been received a single zero-byte read is retried once before the
    /// response is considered complete.
    pub fn fetch_buffered(&self, url: &str) -> Result<Vec<u8>> {
        let my_generation = self.generation.load(Ordering::Relaxed);

        let mut stream = None;
        let attempts = self.config.open_attempts.max(1);
        for attempt in 0..attempts {
            if self.cancelled() || self.stale(my_generation) {
                return Err(anyhow!("request cancelled"));
            }
            match self
                .transport
                .open(url, HttpMethod::Get, self.config.request_timeout)
            {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) if attempt + 1 < attempts => {
                    tracing::warn!(url, attempt = attempt + 1, "http open failed: {e:#}");
                    thread::sleep(Duration::from_millis(if attempt == 0 { 200 } else { 400 }));
                }
                Err(e) => return Err(e),
            }
        }
        let mut stream = stream.ok_or_else(|| anyhow!("http open exhausted retries"))?;

        if stream.status() != 200 {
            return Err(anyhow!("http status {} for {url}", stream.status()));
        }

        let mut out = Vec::new();
        let mut buf = vec![0u8; 2048];
        let mut quiescent_retries = 0u32;
        loop {
            if self.cancelled() || self.stale(my_generation) {
                return Err(anyhow!("request cancelled"));
            }
            if out.len() >= self.config.max_response_bytes {
                tracing::warn!(url, bytes = out.len(), "response buffer full, stopping read");
                break;
            }
            let want = buf.len().min(self.config.max_response_bytes - out.len());
            match stream.read(&mut buf[..want]) {
                Ok(0) => {
                    if out.is_empty() {
                        // Nothing yet; the server may still be trickling.
                        quiescent_retries += 1;
                        if quiescent_retries > 1 {
                            break;
                        }
                        thread::sleep(Duration::from_millis(200));
                    } else {
                        quiescent_retries += 1;
                        if quiescent_retries > 1 {
                            break;
                        }
                        thread::sleep(Duration::from_millis(50));
                    }
                }
                Ok(n) => {
                    quiescent_retries = 0;
                    out.extend_from_slice(&buf[..n]);
                }
                // Transport failure mid-body: no retry benefit.
                Err(e) => return Err(anyhow!("http read failed for {url}: {e}")),
            }
        }

        if self.stale(my_generation) {
            return Err(anyhow!("request superseded"));
        }
        Ok(out)
    }

    /// Open the long-lived media stream. Rejects non-200 responses.
    pub fn open_stream(&self, url: &str) -> Result<Box<dyn HttpStream>> {
        if self.cancelled() {
            return Err(anyhow!("request cancelled"));
        }
        let stream = self
            .transport
            .open(url, HttpMethod::Get, self.config.stream_timeout)?;
        if stream.status() != 200 {
            return Err(anyhow!("http status {} for {url}", stream.status()));
        }
        Ok(stream)
    }

    /// Read the next chunk of the media body. `Ok(0)` is end of stream.
    pub fn read_chunk(&self, stream: &mut dyn HttpStream, buf: &mut [u8]) -> Result<usize> {
        if self.cancelled() {
            return Err(anyhow!("request cancelled"));
        }
        let n = stream.read(buf).map_err(|e| anyhow!("stream read: {e}"))?;
        if self.cancelled() {
            return Err(anyhow!("request cancelled"));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    struct ScriptedStream {
        status: u16,
        // Each entry is one read result; `None` simulates a zero-byte read.
        reads: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl HttpStream for ScriptedStream {
        fn status(&self) -> u16 {
            self.status
        }
        fn header(&self, _name: &str) -> Option<String> {
            None
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut reads = self.reads.lock().unwrap();
            match reads.pop() {
                Some(Some(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(None) | None => Ok(0),
            }
        }
    }

    struct ScriptedTransport {
        status: u16,
        // Reversed so `pop()` yields reads in order.
        reads: Vec<Option<Vec<u8>>>,
        fail_opens: Mutex<u32>,
    }

    impl HttpTransport for ScriptedTransport {
        fn open(
            &self,
            _url: &str,
            _method: HttpMethod,
            _timeout: Duration,
        ) -> Result<Box<dyn HttpStream>> {
            let mut fails = self.fail_opens.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(anyhow!("connect refused"));
            }
            let mut reads = self.reads.clone();
            reads.reverse();
            Ok(Box::new(ScriptedStream {
                status: self.status,
                reads: Mutex::new(reads),
            }))
        }
    }

    fn fetcher(transport: ScriptedTransport) -> HttpFetcher {
        HttpFetcher::new(
            Arc::new(transport),
            Arc::new(AtomicBool::new(false)),
            FetchConfig::default(),
        )
    }

    #[test]
    fn fetch_buffered_collects_trickled_body() {
        let f = fetcher(ScriptedTransport {
            status: 200,
            reads: vec![Some(b"hello ".to_vec()), None, Some(b"world".to_vec())],
            fail_opens: Mutex::new(0),
        });
        let body = f.fetch_buffered("http://example/api").unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn fetch_buffered_stops_after_second_quiescent_read() {
        let f = fetcher(ScriptedTransport {
            status: 200,
            reads: vec![Some(b"data".to_vec()), None, None, Some(b"late".to_vec())],
            fail_opens: Mutex::new(0),
        });
        let body = f.fetch_buffered("http://example/api").unwrap();
        assert_eq!(body, b"data");
    }

    #[test]
    fn fetch_buffered_retries_failed_opens() {
        let f = fetcher(ScriptedTransport {
            status: 200,
            reads: vec![Some(b"ok".to_vec())],
            fail_opens: Mutex::new(2),
        });
        let body = f.fetch_buffered("http://example/api").unwrap();
        assert_eq!(body, b"ok");
    }

    #[test]
    fn fetch_buffered_gives_up_when_opens_exhaust() {
        let f = fetcher(ScriptedTransport {
            status: 200,
            reads: vec![Some(b"ok".to_vec())],
            fail_opens: Mutex::new(3),
        });
        assert!(f.fetch_buffered("http://example/api").is_err());
    }

    #[test]
    fn fetch_buffered_rejects_error_status() {
        let f = fetcher(ScriptedTransport {
            status: 404,
            reads: vec![Some(b"nope".to_vec())],
            fail_opens: Mutex::new(0),
        });
        assert!(f.fetch_buffered("http://example/api").is_err());
    }

    #[test]
    fn fetch_buffered_caps_response_size() {
        let big = vec![Some(vec![0u8; 4096]); 8];
        let f = HttpFetcher::new(
            Arc::new(ScriptedTransport {
                status: 200,
                reads: big,
                fail_opens: Mutex::new(0),
            }),
            Arc::new(AtomicBool::new(false)),
            FetchConfig {
                max_response_bytes: 8192,
                ..FetchConfig::default()
            },
        );
        let body = f.fetch_buffered("http://example/api").unwrap();
        assert_eq!(body.len(), 8192);
    }

    #[test]
    fn cancel_aborts_before_open() {
        let cancel = Arc::new(AtomicBool::new(true));
        let f = HttpFetcher::new(
            Arc::new(ScriptedTransport {
                status: 200,
                reads: vec![Some(b"ok".to_vec())],
                fail_opens: Mutex::new(0),
            }),
            cancel,
            FetchConfig::default(),
        );
        assert!(f.fetch_buffered("http://example/api").is_err());
        assert!(f.open_stream("http://example/api").is_err());
    }

    #[test]
    fn abort_invalidates_in_flight_generation() {
        let f = fetcher(ScriptedTransport {
            status: 200,
            reads: vec![Some(b"ok".to_vec())],
            fail_opens: Mutex::new(0),
        });
        f.abort();
        assert!(f.cancelled());
        assert!(f.fetch_buffered("http://example/api").is_err());
    }
}
