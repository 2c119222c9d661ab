//! HTTP transport seam.
//!
//! The pipeline never talks to `ureq` directly; it goes through
//! [`HttpTransport`] so tests can substitute a scripted transport and so
//! the streaming read path stays mockable end to end.

use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, Result};

/// Request method for [`HttpTransport::open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// An open HTTP response: status line, headers, and a blocking body reader.
pub trait HttpStream: Send {
    fn status(&self) -> u16;
    fn header(&self, name: &str) -> Option<String>;
    /// Read body bytes. `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens HTTP requests and hands back a readable response.
pub trait HttpTransport: Send + Sync {
    fn open(&self, url: &str, method: HttpMethod, timeout: Duration) -> Result<Box<dyn HttpStream>>;
}

/// Production transport over `ureq`.
#[derive(Clone, Debug, Default)]
pub struct UreqTransport;

struct UreqStream {
    status: u16,
    headers: ureq::http::HeaderMap,
    reader: Box<dyn Read + Send>,
}

impl HttpStream for UreqStream {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl HttpTransport for UreqTransport {
    fn open(&self, url: &str, method: HttpMethod, timeout: Duration) -> Result<Box<dyn HttpStream>> {
        let resp = match method {
            HttpMethod::Get => ureq::get(url)
                .config()
                .timeout_per_call(Some(timeout))
                // Status handling belongs to the caller; 4xx/5xx are
                // responses, not transport failures.
                .http_status_as_error(false)
                .build()
                .header("Accept", "application/json, audio/mpeg")
                .header("User-Agent", "music-stream")
                .call(),
            HttpMethod::Post => ureq::post(url)
                .config()
                .timeout_per_call(Some(timeout))
                .http_status_as_error(false)
                .build()
                .header("Accept", "application/json")
                .header("User-Agent", "music-stream")
                .send_empty(),
        }
        .with_context(|| format!("http open {url}"))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let (_, body) = resp.into_parts();
        Ok(Box::new(UreqStream {
            status,
            headers,
            reader: Box::new(body.into_reader()),
        }))
    }
}
