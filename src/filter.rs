//! Adaptive resample filter.
//!
//! Fixed-ratio speed-up (2 outputs per 7 input samples, ~3.5x) combined
//! with perceptual smoothing. A running high-frequency energy estimate and
//! a voice-ratio estimate switch the filter between two regimes with
//! different lookback depths and weight tables; in the high-frequency
//! regime each output is additionally low-passed against the previous
//! output, with the strength tied to the voice ratio so vocal content
//! keeps its intelligibility while instrumental noise is smoothed harder.
//!
//! This is a perceptual filter, not a textbook resampler. The weight
//! constants are tuned defaults; the two-regime structure and the window
//! shapes are the contract.

const HISTORY_LEN: usize = 16;
const ANALYSIS_WINDOW: usize = 64;
const ENERGY_ENTER_THRESHOLD: i32 = 30;
const ENERGY_EXIT_THRESHOLD: i32 = 20;
const SILENCE_FRAME_LIMIT: u32 = 5;

pub struct AdaptiveResampleFilter {
    history: [i16; HISTORY_LEN],
    freq_energy: i32,
    voice_ratio: i32,
    high_freq_mode: bool,
    silence_frames: u32,
}

impl Default for AdaptiveResampleFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveResampleFilter {
    pub fn new() -> Self {
        Self {
            history: [0; HISTORY_LEN],
            freq_energy: 0,
            voice_ratio: 50,
            high_freq_mode: false,
            silence_frames: 0,
        }
    }

    /// Clear all running state at the start of a playback session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[cfg(test)]
    pub(crate) fn high_freq_mode(&self) -> bool {
        self.high_freq_mode
    }

    /// Filter one decoded frame, emitting roughly 2 samples per 7 inputs.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if samples.is_empty() {
            return Vec::new();
        }

        self.update_spectral_estimates(samples);

        let mut out = Vec::with_capacity(samples.len() / 3 + 16);
        let mut i = 0;
        while i < samples.len() {
            // First output: current group samples 0..2 blended with history.
            let (hist_depth, base, decay) = if self.high_freq_mode {
                (12, 6, 1)
            } else {
                (6, 10, 2)
            };
            self.emit_weighted(samples, i, 0, 3, hist_depth, base, decay, &mut out);

            // Second output: group samples 3..6, shallower lookback.
            if i + 3 < samples.len() {
                let hist_depth = if self.high_freq_mode { 6 } else { 3 };
                let base = if self.high_freq_mode {
                    7 + self.voice_ratio / 12
                } else {
                    10
                };
                self.emit_weighted(samples, i, 3, 7, hist_depth, base, decay, &mut out);
            }

            i += 7;
        }
        out
    }

    /// Refresh the smoothed energy/voice estimates from a frame prefix.
    fn update_spectral_estimates(&mut self, samples: &[i16]) {
        let window = samples.len().min(ANALYSIS_WINDOW);
        let mut total_energy: i32 = 0;
        let mut high_freq: i32 = 0;
        let mut mid_freq: i32 = 0;
        for i in 1..window {
            let diff = (samples[i] as i32 - samples[i - 1] as i32).abs();
            let mid_diff = if i >= 3 {
                (samples[i] as i32 - samples[i - 3] as i32).abs() / 3
            } else {
                0
            };
            total_energy += (samples[i] as i32).abs();
            high_freq += diff;
            mid_freq += mid_diff;
        }

        if total_energy > 0 {
            // 3:1 exponential smoothing, matching the tuned defaults.
            self.freq_energy = (self.freq_energy * 3 + high_freq * 100 / total_energy) / 4;
            let voice_ratio_raw = if high_freq > 0 {
                mid_freq * 100 / high_freq
            } else {
                0
            };

            if self.freq_energy > ENERGY_ENTER_THRESHOLD {
                self.high_freq_mode = true;
            } else if self.freq_energy < ENERGY_EXIT_THRESHOLD {
                self.high_freq_mode = false;
            }

            self.voice_ratio = (self.voice_ratio * 3 + voice_ratio_raw) / 4;
        }

        let is_silence = total_energy < 500 * window as i32;
        if is_silence {
            self.silence_frames += 1;
            if self.silence_frames > SILENCE_FRAME_LIMIT {
                self.freq_energy = 0;
                self.high_freq_mode = false;
            }
        } else {
            self.silence_frames = 0;
        }
    }

    /// One weighted average over `history` plus group samples
    /// `group_start..group_end`, clamped and (in high-frequency mode)
    /// low-passed against the previous emitted sample.
    #[allow(clippy::too_many_arguments)]
    fn emit_weighted(
        &mut self,
        samples: &[i16],
        i: usize,
        group_start: usize,
        group_end: usize,
        hist_depth: i32,
        base: i32,
        decay: i32,
        out: &mut Vec<i16>,
    ) {
        let mut weighted: i32 = 0;
        let mut weights: i32 = 0;

        for j in 0..hist_depth {
            // Fold indexes above 7 back down so a deep lookback revisits
            // the oldest history entries.
            let idx = if j < 8 { j } else { 15 - (j - 8) } as usize;
            let weight = if self.high_freq_mode {
                (hist_depth - j) / 2 + 1
            } else {
                (hist_depth - j) / 3 + 1
            };
            weighted += self.history[idx] as i32 * weight;
            weights += weight;
        }

        for j in group_start..group_end {
            if i + j >= samples.len() {
                break;
            }
            let weight = base - (j - group_start) as i32 * decay;
            weighted += samples[i + j] as i32 * weight;
            weights += weight;
            self.push_history(samples[i + j]);
        }

        if weights > 0 {
            let mut value = weighted / weights;
            value = value.clamp(i16::MIN as i32, i16::MAX as i32);

            if self.high_freq_mode {
                if let Some(&prev) = out.last() {
                    let voice_factor = 70 - self.voice_ratio / 2;
                    let smoothing = voice_factor.max(30).min(70);
                    value = (value * smoothing + prev as i32 * (100 - smoothing)) / 100;
                }
            }

            out.push(value as i16);
        }
    }

    fn push_history(&mut self, sample: i16) {
        for k in (1..HISTORY_LEN).rev() {
            self.history[k] = self.history[k - 1];
        }
        self.history[0] = sample;
    }
}
