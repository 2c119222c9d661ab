//! LRC lyric parsing and playback-time synchronization.
//!
//! Parsing accepts the common `[mm:ss.xx]` prefix form, including multiple
//! time tags on one line. Lines that fail to parse are skipped; an empty
//! parse result simply leaves the subsystem inert.

/// One timestamped lyric line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LyricLine {
    pub timestamp_ms: u64,
    pub text: String,
}

/// Parse LRC text into a timestamp-sorted line list.
///
/// Metadata tags (`[ar:...]`, `[ti:...]` and friends) and malformed
/// timestamps are skipped, not errors.
pub fn parse_lrc(text: &str) -> Vec<LyricLine> {
    let mut lines = Vec::new();

    for raw in text.lines() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let mut rest = raw;
        let mut stamps = Vec::new();
        while let Some(open) = rest.find('[') {
            let Some(close_rel) = rest[open..].find(']') else {
                break;
            };
            let close = open + close_rel;
            match parse_timestamp_ms(&rest[open + 1..close]) {
                Some(ms) => stamps.push(ms),
                None => break, // metadata tag or garbage; no time tags follow
            }
            rest = &rest[close + 1..];
        }

        if stamps.is_empty() {
            continue;
        }
        let text = rest.trim();
        if text.is_empty() {
            continue;
        }
        for ms in stamps {
            lines.push(LyricLine {
                timestamp_ms: ms,
                text: text.to_string(),
            });
        }
    }

    lines.sort_by_key(|l| l.timestamp_ms);
    lines
}

/// Parse `mm:ss`, `mm:ss.x`, `mm:ss.xx` or `mm:ss.xxx` into milliseconds.
fn parse_timestamp_ms(tag: &str) -> Option<u64> {
    let (mins, rest) = tag.split_once(':')?;
    let mins: u64 = mins.trim().parse().ok()?;
    let (secs, frac) = match rest.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (rest, None),
    };
    let secs: u64 = secs.trim().parse().ok()?;
    let millis = match frac {
        None => 0,
        Some(f) => {
            let digits: u64 = f.trim().parse().ok()?;
            match f.trim().len() {
                1 => digits * 100,
                2 => digits * 10,
                3 => digits,
                _ => return None,
            }
        }
    };
    Some(mins * 60_000 + secs * 1000 + millis)
}

/// Walks a sorted lyric list against elapsed playback time.
///
/// [`LyricsSync::tick`] returns the newly-current line exactly once per
/// actual cursor change, so repeated calls with the same elapsed time are
/// idempotent and emission is monotonic in timestamp.
pub struct LyricsSync {
    lines: Vec<LyricLine>,
    cursor: Option<usize>,
}

impl LyricsSync {
    pub fn new(mut lines: Vec<LyricLine>) -> Self {
        lines.sort_by_key(|l| l.timestamp_ms);
        Self {
            lines,
            cursor: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Advance the cursor to the latest line at or before `elapsed_ms`.
    pub fn tick(&mut self, elapsed_ms: u64) -> Option<&LyricLine> {
        let mut next = self.cursor;
        let start = next.map_or(0, |i| i + 1);
        for i in start..self.lines.len() {
            if self.lines[i].timestamp_ms <= elapsed_ms {
                next = Some(i);
            } else {
                break;
            }
        }
        if next != self.cursor {
            self.cursor = next;
            return next.map(|i| &self.lines[i]);
        }
        None
    }
}
