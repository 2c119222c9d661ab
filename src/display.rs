//! User-facing status notifications.
//!
//! The pipeline reports track metadata, lyric lines and error states
//! through [`DisplayNotifier`]; what a "display" is (screen, TTS, log) is
//! up to the host. [`LogNotifier`] routes everything to structured logs.

/// Which surface a message is destined for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayRole {
    /// Track title/artist and playback state.
    NowPlaying,
    /// Time-synchronized lyric lines.
    Lyrics,
    /// Error and status notices.
    Notice,
}

pub trait DisplayNotifier: Send + Sync {
    fn set_message(&self, role: DisplayRole, text: &str);
}

/// Default notifier: structured log output, one event per message.
#[derive(Default)]
pub struct LogNotifier;

impl DisplayNotifier for LogNotifier {
    fn set_message(&self, role: DisplayRole, text: &str) {
        match role {
            DisplayRole::NowPlaying => tracing::info!(target: "display", now_playing = %text),
            DisplayRole::Lyrics => tracing::info!(target: "display", lyric = %text),
            DisplayRole::Notice => tracing::warn!(target: "display", notice = %text),
        }
    }
}
