//! Energy-based voice activity detection with hold timers.
//!
//! A frame counts as speech only when its RMS energy clears both the noise
//! floor and the configured energy threshold. Two hold timers gate the state
//! transitions so single noisy frames cannot flap the speaking flag:
//! sustained speech for `speech_hold_s` flips silent → speaking, sustained
//! silence for `silence_hold_s` flips speaking → silent. Timer comparisons
//! use the caller-supplied clock, which keeps the behavior deterministic
//! under test.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::config::VadSettings;

use super::codec::compute_rms_energy;

/// Bounded energy history length (most recent frames).
const MAX_ENERGY_HISTORY: usize = 10;

/// Per-frame VAD output.
#[derive(Debug, Clone, Copy)]
pub struct VadResult {
    /// Detector state after this frame
    pub is_speaking: bool,
    /// Whether this frame alone classified as speech
    pub speech_detected: bool,
    /// RMS energy of this frame
    pub energy: f32,
    /// Mean over the rolling energy history
    pub average_energy: f32,
    /// Clock value the frame was processed at
    pub timestamp: Instant,
}

/// Voice activity detector for one audio stream.
pub struct VoiceActivityDetector {
    settings: VadSettings,
    is_speaking: bool,
    /// Armed when the first speech frame arrives while silent
    speech_start: Option<Instant>,
    /// Armed when the first silent frame arrives while speaking
    silence_start: Option<Instant>,
    energy_history: VecDeque<f32>,
}

impl VoiceActivityDetector {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            is_speaking: false,
            speech_start: None,
            silence_start: None,
            energy_history: VecDeque::with_capacity(MAX_ENERGY_HISTORY),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Process one slin16 frame at time `now`.
    ///
    /// Malformed input (empty, or no complete sample) yields an energy-0
    /// result and leaves the state machine untouched.
    pub fn process_frame(&mut self, frame: &[u8], now: Instant) -> VadResult {
        if frame.len() < super::SAMPLE_WIDTH {
            return VadResult {
                is_speaking: self.is_speaking,
                speech_detected: false,
                energy: 0.0,
                average_energy: self.average_energy(),
                timestamp: now,
            };
        }

        let energy = compute_rms_energy(frame);
        self.energy_history.push_back(energy);
        if self.energy_history.len() > MAX_ENERGY_HISTORY {
            self.energy_history.pop_front();
        }

        let speech_detected =
            energy > self.settings.noise_floor && energy > self.settings.energy_threshold;

        if speech_detected {
            if self.is_speaking {
                // Speech while the silence countdown runs resets it
                self.silence_start = None;
            } else {
                self.silence_start = None;
                match self.speech_start {
                    None => self.speech_start = Some(now),
                    Some(start)
                        if now.duration_since(start).as_secs_f64()
                            >= self.settings.speech_hold_s =>
                    {
                        self.is_speaking = true;
                        self.speech_start = None;
                        debug!(energy, "speech started");
                    }
                    Some(_) => {}
                }
            }
        } else if self.is_speaking {
            match self.silence_start {
                None => {
                    self.silence_start = Some(now);
                    self.speech_start = None;
                }
                Some(start)
                    if now.duration_since(start).as_secs_f64()
                        >= self.settings.silence_hold_s =>
                {
                    self.is_speaking = false;
                    self.silence_start = None;
                    debug!(energy, "speech stopped");
                }
                Some(_) => {}
            }
        } else {
            // Silent frame while already silent disarms any pending start
            self.speech_start = None;
        }

        VadResult {
            is_speaking: self.is_speaking,
            speech_detected,
            energy,
            average_energy: self.average_energy(),
            timestamp: now,
        }
    }

    fn average_energy(&self) -> f32 {
        if self.energy_history.is_empty() {
            return 0.0;
        }
        self.energy_history.iter().sum::<f32>() / self.energy_history.len() as f32
    }

    /// Clear history and timers; the detector returns to silent.
    pub fn reset(&mut self) {
        self.is_speaking = false;
        self.speech_start = None;
        self.silence_start = None;
        self.energy_history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_bytes;
    use std::time::Duration;

    fn settings() -> VadSettings {
        VadSettings {
            energy_threshold: 4000.0,
            noise_floor: 2000.0,
            speech_hold_s: 0.02,
            silence_hold_s: 0.5,
        }
    }

    fn loud_frame() -> Vec<u8> {
        samples_to_bytes(&vec![8000i16; 320])
    }

    fn quiet_frame() -> Vec<u8> {
        samples_to_bytes(&vec![100i16; 320])
    }

    /// Feed `n` frames 20 ms apart starting at `t0`; returns the final state.
    fn feed(
        vad: &mut VoiceActivityDetector,
        frame: &[u8],
        t0: Instant,
        n: usize,
    ) -> Instant {
        let mut t = t0;
        for _ in 0..n {
            vad.process_frame(frame, t);
            t += Duration::from_millis(20);
        }
        t
    }

    #[test]
    fn test_empty_frame_leaves_state_unchanged() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t = Instant::now();
        let result = vad.process_frame(&[], t);
        assert_eq!(result.energy, 0.0);
        assert!(!result.is_speaking);
        assert!(!result.speech_detected);

        // Same while speaking
        feed(&mut vad, &loud_frame(), t, 3);
        assert!(vad.is_speaking());
        let result = vad.process_frame(&[0u8], t + Duration::from_millis(60));
        assert_eq!(result.energy, 0.0);
        assert!(result.is_speaking);
    }

    #[test]
    fn test_speech_start_requires_hold() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t0 = Instant::now();

        // First loud frame arms the timer but does not transition
        let r = vad.process_frame(&loud_frame(), t0);
        assert!(r.speech_detected);
        assert!(!r.is_speaking);

        // 20 ms later the 0.02 s hold is satisfied
        let r = vad.process_frame(&loud_frame(), t0 + Duration::from_millis(20));
        assert!(r.is_speaking);
    }

    #[test]
    fn test_exact_hold_fires_on_next_frame_not_before() {
        let mut vad = VoiceActivityDetector::new(VadSettings {
            speech_hold_s: 0.04,
            ..settings()
        });
        let t0 = Instant::now();
        vad.process_frame(&loud_frame(), t0);
        let r = vad.process_frame(&loud_frame(), t0 + Duration::from_millis(20));
        assert!(!r.is_speaking, "hold not yet satisfied at 20 ms");
        let r = vad.process_frame(&loud_frame(), t0 + Duration::from_millis(40));
        assert!(r.is_speaking, "hold satisfied at exactly 40 ms");
    }

    #[test]
    fn test_silence_stop_requires_hold() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t0 = Instant::now();
        let t = feed(&mut vad, &loud_frame(), t0, 3);
        assert!(vad.is_speaking());

        // 24 quiet frames = 480 ms, still under the 500 ms hold
        let t = feed(&mut vad, &quiet_frame(), t, 24);
        assert!(vad.is_speaking());

        // Two more pushes past 500 ms
        feed(&mut vad, &quiet_frame(), t, 2);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_speech_resets_silence_countdown() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t0 = Instant::now();
        let t = feed(&mut vad, &loud_frame(), t0, 3);

        // 400 ms of silence, then a speech frame, then 400 ms more silence:
        // neither run satisfies the 500 ms hold
        let t = feed(&mut vad, &quiet_frame(), t, 20);
        let t = feed(&mut vad, &loud_frame(), t, 1);
        feed(&mut vad, &quiet_frame(), t, 20);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_noise_floor_rejects_mid_energy_frames() {
        // Energy above a low threshold but below the noise floor is not speech
        let mut vad = VoiceActivityDetector::new(VadSettings {
            energy_threshold: 1000.0,
            noise_floor: 2000.0,
            ..settings()
        });
        let frame = samples_to_bytes(&vec![1500i16; 320]);
        let t0 = Instant::now();
        let r = vad.process_frame(&frame, t0);
        assert!(!r.speech_detected);
        feed(&mut vad, &frame, t0, 10);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_average_energy_history_is_bounded() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t0 = Instant::now();
        feed(&mut vad, &quiet_frame(), t0, 50);
        assert_eq!(vad.energy_history.len(), MAX_ENERGY_HISTORY);
        let r = vad.process_frame(&quiet_frame(), t0 + Duration::from_secs(2));
        assert!((r.average_energy - r.energy).abs() < 1.0);
    }

    #[test]
    fn test_reset() {
        let mut vad = VoiceActivityDetector::new(settings());
        let t0 = Instant::now();
        feed(&mut vad, &loud_frame(), t0, 5);
        assert!(vad.is_speaking());
        vad.reset();
        assert!(!vad.is_speaking());
        assert!(vad.energy_history.is_empty());
    }
}
