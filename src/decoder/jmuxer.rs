// Software mux back-end
// Assembles the raw NAL stream into timed access-unit frames; always available

use super::annexb::{AccessUnitAssembler, AnnexBSplitter};
use super::{DecodeBackend, DecoderConfig, DecoderError, DecoderType, MediaFrame};
use crate::surface::RenderSurface;

pub struct JmuxerBackend {
    splitter: AnnexBSplitter,
    assembler: AccessUnitAssembler,
    frame_duration_ms: u64,
    next_timestamp: u64,
    /// Output is suppressed until an IDR arrives (stream head and after reset)
    awaiting_keyframe: bool,
    frame_count: u64,
    dropped: u64,
}

impl JmuxerBackend {
    pub fn new() -> Self {
        Self {
            splitter: AnnexBSplitter::new(),
            assembler: AccessUnitAssembler::new(),
            frame_duration_ms: 33,
            next_timestamp: 0,
            awaiting_keyframe: true,
            frame_count: 0,
            dropped: 0,
        }
    }

    fn emit(&mut self, au: super::annexb::AccessUnit) -> Option<MediaFrame> {
        if self.awaiting_keyframe {
            if !au.keyframe() {
                self.dropped += 1;
                log::debug!("Dropping delta frame while waiting for keyframe");
                return None;
            }
            self.awaiting_keyframe = false;
        }

        let timestamp = self.next_timestamp;
        self.next_timestamp += self.frame_duration_ms;
        self.frame_count += 1;

        let data = au.to_annexb();
        Some(if au.keyframe() {
            MediaFrame::key(DecoderType::Jmuxer, timestamp, data)
        } else {
            MediaFrame::delta(DecoderType::Jmuxer, timestamp, data)
        })
    }
}

impl Default for JmuxerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeBackend for JmuxerBackend {
    fn init(
        &mut self,
        config: &DecoderConfig,
        surface: &dyn RenderSurface,
    ) -> Result<(), DecoderError> {
        if !surface.supports(DecoderType::Jmuxer) {
            return Err(DecoderError::InitError(
                "Surface does not accept muxed frames".to_string(),
            ));
        }

        self.frame_duration_ms = config.frame_duration_ms();
        self.next_timestamp = 0;
        self.frame_count = 0;
        self.dropped = 0;
        self.awaiting_keyframe = true;
        self.splitter.reset();
        self.assembler.reset();

        log::info!(
            "Software mux initialized: {}x{} @ {} fps",
            config.width,
            config.height,
            config.fps_hint
        );
        Ok(())
    }

    fn push(&mut self, data: &[u8]) -> Result<Vec<MediaFrame>, DecoderError> {
        self.splitter.feed(data);

        let mut frames = Vec::new();
        loop {
            match self.splitter.next_unit() {
                Ok(Some(nal)) => {
                    if let Some(au) = self.assembler.push(nal) {
                        if let Some(frame) = self.emit(au) {
                            frames.push(frame);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Corrupt unit: drop the half-built picture and resume
                    // at the next keyframe
                    self.assembler.reset();
                    self.awaiting_keyframe = true;
                    if frames.is_empty() {
                        return Err(e);
                    }
                    log::warn!("Stream fault after {} good frames: {}", frames.len(), e);
                    return Ok(frames);
                }
            }
        }

        Ok(frames)
    }

    fn flush(&mut self) -> Vec<MediaFrame> {
        let mut frames = Vec::new();
        if let Some(nal) = self.splitter.flush_unit() {
            if let Some(au) = self.assembler.push(nal) {
                if let Some(frame) = self.emit(au) {
                    frames.push(frame);
                }
            }
        }
        if let Some(au) = self.assembler.flush() {
            if let Some(frame) = self.emit(au) {
                frames.push(frame);
            }
        }
        frames
    }

    fn reset(&mut self) {
        self.splitter.reset();
        self.assembler.reset();
        self.awaiting_keyframe = true;
    }

    fn info(&self) -> &str {
        "jmuxer (software mux)"
    }
}

#[cfg(test)]
mod tests {
    use super::super::FrameKind;
    use super::*;
    use crate::decoder::annexb::START_CODE;

    struct AnySurface;

    impl RenderSurface for AnySurface {
        fn supports(&self, _decoder: DecoderType) -> bool {
            true
        }
        fn submit(&self, _frame: MediaFrame) -> Result<(), crate::surface::SurfaceError> {
            Ok(())
        }
        fn clear(&self) {}
    }

    fn nal(nal_type: u8, len: usize) -> Vec<u8> {
        let mut v = vec![START_CODE[0], START_CODE[1], START_CODE[2], START_CODE[3]];
        v.push(nal_type);
        v.extend(std::iter::repeat(0x42).take(len));
        v
    }

    fn init_backend(fps: u32) -> JmuxerBackend {
        let mut backend = JmuxerBackend::new();
        let config = DecoderConfig {
            fps_hint: fps,
            ..DecoderConfig::for_device(1)
        };
        backend.init(&config, &AnySurface).unwrap();
        backend
    }

    #[test]
    fn test_assembles_timed_frames() {
        let mut backend = init_backend(25);

        let mut stream = Vec::new();
        stream.extend(nal(7, 8)); // SPS
        stream.extend(nal(8, 4)); // PPS
        stream.extend(nal(5, 64)); // IDR
        stream.extend(nal(1, 32)); // delta
        stream.extend(nal(1, 32)); // delta

        let mut frames = backend.push(&stream).unwrap();
        frames.extend(backend.flush());

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, FrameKind::Key);
        assert_eq!(frames[1].kind, FrameKind::Delta);
        assert_eq!(frames[2].kind, FrameKind::Delta);

        // 25 fps -> 40ms spacing
        assert_eq!(frames[0].timestamp, 0);
        assert_eq!(frames[1].timestamp, 40);
        assert_eq!(frames[2].timestamp, 80);

        // Keyframe carries its config NALs
        assert!(frames[0].data.len() > frames[1].data.len());
    }

    #[test]
    fn test_waits_for_keyframe_at_stream_head() {
        let mut backend = init_backend(30);

        // Joined mid-GOP: deltas before the first IDR are dropped
        let mut stream = Vec::new();
        stream.extend(nal(1, 32));
        stream.extend(nal(1, 32));
        stream.extend(nal(5, 64));
        stream.extend(nal(1, 32));

        let mut frames = backend.push(&stream).unwrap();
        frames.extend(backend.flush());

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_key());
        assert_eq!(frames[1].kind, FrameKind::Delta);
    }

    #[test]
    fn test_corrupt_unit_is_transient() {
        let mut backend = init_backend(30);

        let mut stream = Vec::new();
        stream.extend(nal(0x80, 4)); // forbidden bit set
        stream.extend(nal(1, 16));

        let err = backend.push(&stream).unwrap_err();
        assert!(err.is_transient());

        // Recovers at the next keyframe
        let mut stream = Vec::new();
        stream.extend(nal(5, 64));
        stream.extend(nal(1, 16));
        let mut frames = backend.push(&stream).unwrap();
        frames.extend(backend.flush());
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_key());
    }
}
