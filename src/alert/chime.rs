use rodio::Source;
use std::f32::consts::PI;
use std::time::Duration;

const SAMPLE_RATE: u32 = 44100;
const TONE_HZ: f32 = 880.0;
const AMPLITUDE: f32 = 0.5;
/// Fade in/out per beep, avoids clicks at the edges.
const RAMP_SECS: f32 = 0.01;

/// (tone on, silence after) in seconds: two short beeps, then a pause.
const PATTERN: [(f32, f32); 2] = [(0.18, 0.12), (0.18, 0.72)];

/// Endless two-beep alert pattern. Loops until the sink is stopped.
pub struct AlertChime {
    sample_rate: u32,
    num_sample: u64,
    cycle_secs: f32,
}

impl AlertChime {
    pub fn new() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            num_sample: 0,
            cycle_secs: PATTERN.iter().map(|(on, off)| on + off).sum(),
        }
    }

    /// Envelope at `offset` seconds into the pattern cycle: 0 in the gaps,
    /// ramped 0..1 inside a beep.
    fn envelope(&self, offset: f32) -> f32 {
        let mut start = 0.0;
        for (on, off) in PATTERN {
            if offset < start + on {
                let into = offset - start;
                let left = on - into;
                return (into / RAMP_SECS).min(left / RAMP_SECS).min(1.0);
            }
            start += on + off;
            if offset < start {
                return 0.0;
            }
        }
        0.0
    }
}

impl Default for AlertChime {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for AlertChime {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let t = self.num_sample as f32 / self.sample_rate as f32;
        self.num_sample = self.num_sample.wrapping_add(1);

        let offset = t % self.cycle_secs;
        let sample = (2.0 * PI * TONE_HZ * t).sin() * self.envelope(offset);
        Some(sample * AMPLITUDE)
    }
}

impl Source for AlertChime {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_between_beeps() {
        let chime = AlertChime::new();
        assert_eq!(chime.envelope(0.25), 0.0);
        assert_eq!(chime.envelope(1.0), 0.0);
        assert!(chime.envelope(0.09) > 0.99);
    }

    #[test]
    fn never_ends() {
        let samples = AlertChime::new().take(SAMPLE_RATE as usize * 3).count();
        assert_eq!(samples, SAMPLE_RATE as usize * 3);
    }
}
