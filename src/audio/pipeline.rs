//! Per-session audio pipeline: VAD plus bounded input/output buffers.
//!
//! One pipeline exists per call session and is driven only from that
//! session's task. It validates inbound frames, tracks the speaking edge so
//! the dispatcher sees clean `SpeechStarted` / `SpeechStopped` events, and
//! counts malformed frames instead of propagating per-frame errors.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::{AudioSettings, VadSettings};

use super::{AudioBuffer, VadResult, VoiceActivityDetector, SAMPLE_WIDTH};

/// Speaking-state edge produced by a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    SpeechStarted,
    SpeechStopped {
        /// Time from the start edge to the stop edge
        duration: Duration,
    },
}

pub struct AudioPipeline {
    settings: AudioSettings,
    vad: VoiceActivityDetector,
    input: AudioBuffer,
    output: AudioBuffer,
    was_speaking: bool,
    speech_started_at: Option<Instant>,
    malformed_frames: u64,
    /// Bytes written to the input buffer since the last drain
    uncommitted_audio: usize,
}

impl AudioPipeline {
    pub fn new(settings: AudioSettings, vad_settings: VadSettings) -> Self {
        Self {
            settings,
            vad: VoiceActivityDetector::new(vad_settings),
            input: AudioBuffer::new(settings.buffer_bytes()),
            output: AudioBuffer::new(settings.buffer_bytes()),
            was_speaking: false,
            speech_started_at: None,
            malformed_frames: 0,
            uncommitted_audio: 0,
        }
    }

    /// Process one inbound frame from the PBX.
    ///
    /// Malformed frames (empty or not sample-aligned) are counted and
    /// swallowed: the VAD result carries energy 0 and the state is unchanged.
    pub fn process_input(&mut self, frame: &[u8], now: Instant) -> (VadResult, Option<PipelineEvent>) {
        if frame.is_empty() || frame.len() % SAMPLE_WIDTH != 0 {
            self.malformed_frames += 1;
            trace!(len = frame.len(), "malformed inbound frame");
            let result = self.vad.process_frame(&[], now);
            return (result, None);
        }

        self.input.write(frame);
        self.uncommitted_audio += frame.len();
        let result = self.vad.process_frame(frame, now);

        let event = match (self.was_speaking, result.is_speaking) {
            (false, true) => {
                self.speech_started_at = Some(now);
                Some(PipelineEvent::SpeechStarted)
            }
            (true, false) => {
                let duration = self
                    .speech_started_at
                    .take()
                    .map(|start| now.duration_since(start))
                    .unwrap_or_default();
                Some(PipelineEvent::SpeechStopped { duration })
            }
            _ => None,
        };
        self.was_speaking = result.is_speaking;
        (result, event)
    }

    /// Queue assistant audio for playback to the PBX.
    pub fn queue_output(&mut self, audio: &[u8]) {
        self.output.write(audio);
    }

    /// Next playback chunk of the configured frame size, if buffered.
    pub fn next_output_chunk(&self) -> Vec<u8> {
        self.output.read(self.settings.chunk_bytes())
    }

    pub fn input_buffer(&self) -> &AudioBuffer {
        &self.input
    }

    pub fn output_buffer(&self) -> &AudioBuffer {
        &self.output
    }

    pub fn is_speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Bytes streamed since the last [`Self::mark_committed`]; used to decide
    /// whether a stop edge closes a real user turn.
    pub fn uncommitted_audio(&self) -> usize {
        self.uncommitted_audio
    }

    pub fn mark_committed(&mut self) {
        self.uncommitted_audio = 0;
    }

    /// Drop buffered audio and reset detection state.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.vad.reset();
        self.was_speaking = false;
        self.speech_started_at = None;
        self.uncommitted_audio = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_bytes;

    fn pipeline() -> AudioPipeline {
        AudioPipeline::new(AudioSettings::default(), VadSettings::default())
    }

    fn loud() -> Vec<u8> {
        samples_to_bytes(&vec![9000i16; 320])
    }

    fn quiet() -> Vec<u8> {
        samples_to_bytes(&vec![50i16; 320])
    }

    #[test]
    fn test_speech_edges() {
        let mut p = pipeline();
        let t0 = Instant::now();
        let mut t = t0;
        let mut started = false;
        for i in 0..5 {
            let (_, event) = p.process_input(&loud(), t);
            if event == Some(PipelineEvent::SpeechStarted) {
                started = true;
                assert!(i <= 2, "speech_started within 2 frames, got frame {i}");
            }
            t += Duration::from_millis(20);
        }
        assert!(started);

        let mut stopped = None;
        for _ in 0..30 {
            let (_, event) = p.process_input(&quiet(), t);
            if let Some(PipelineEvent::SpeechStopped { duration }) = event {
                stopped = Some(duration);
            }
            t += Duration::from_millis(20);
        }
        let duration = stopped.expect("speech_stopped after sustained silence");
        assert!(duration > Duration::from_millis(100));
    }

    #[test]
    fn test_malformed_frame_counted_and_swallowed() {
        let mut p = pipeline();
        let t = Instant::now();
        let (result, event) = p.process_input(&[1, 2, 3], t);
        assert_eq!(result.energy, 0.0);
        assert!(!result.is_speaking);
        assert!(event.is_none());
        assert_eq!(p.malformed_frames(), 1);
        assert_eq!(p.input_buffer().size(), 0);

        let (result, _) = p.process_input(&[], t);
        assert_eq!(result.energy, 0.0);
        assert_eq!(p.malformed_frames(), 2);
    }

    #[test]
    fn test_output_chunking() {
        let mut p = pipeline();
        p.queue_output(&samples_to_bytes(&vec![7i16; 480]));
        let chunk = p.next_output_chunk();
        assert_eq!(chunk.len(), 640);
        // Remaining 160 samples are below one chunk
        assert!(p.next_output_chunk().is_empty());
        assert_eq!(p.output_buffer().size(), 320);
    }

    #[test]
    fn test_uncommitted_audio_tracking() {
        let mut p = pipeline();
        let t = Instant::now();
        p.process_input(&loud(), t);
        p.process_input(&loud(), t + Duration::from_millis(20));
        assert_eq!(p.uncommitted_audio(), 1280);
        p.mark_committed();
        assert_eq!(p.uncommitted_audio(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut p = pipeline();
        let t0 = Instant::now();
        for i in 0..5 {
            p.process_input(&loud(), t0 + Duration::from_millis(20 * i));
        }
        p.queue_output(&loud());
        p.reset();
        assert!(!p.is_speaking());
        assert_eq!(p.input_buffer().size(), 0);
        assert_eq!(p.output_buffer().size(), 0);
        assert_eq!(p.uncommitted_audio(), 0);
    }
}
