// Hardware-accelerated back-end
// Drives the surface's codec sink with key/delta chunks; fails fast when the
// surface has no accelerated path
//
// Chunk semantics follow the platform codec contract: the sink is configured
// with an avc1 codec string derived from the SPS, and delta chunks are
// refused until a keyframe has been submitted.

use super::annexb::{AccessUnit, AccessUnitAssembler, AnnexBSplitter, NalUnit, START_CODE};
use super::{DecodeBackend, DecoderConfig, DecoderError, DecoderType, MediaFrame};
use crate::surface::RenderSurface;
use bytes::{BufMut, BytesMut};

pub struct WebcodecsBackend {
    splitter: AnnexBSplitter,
    assembler: AccessUnitAssembler,
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
    codec_string: Option<String>,
    configured: bool,
    /// The sink refuses deltas until a keyframe arrives; the first refusal is
    /// reported, the rest are dropped silently until the stream recovers
    awaiting_keyframe: bool,
    reported_gap: bool,
    frame_duration_ms: u64,
    next_timestamp: u64,
    frame_count: u64,
}

impl WebcodecsBackend {
    pub fn new() -> Self {
        Self {
            splitter: AnnexBSplitter::new(),
            assembler: AccessUnitAssembler::new(),
            sps: None,
            pps: None,
            codec_string: None,
            configured: false,
            awaiting_keyframe: true,
            reported_gap: false,
            frame_duration_ms: 33,
            next_timestamp: 0,
            frame_count: 0,
        }
    }

    /// avc1.PPCCLL from the SPS profile, constraint and level bytes
    fn derive_codec_string(sps: &NalUnit) -> Result<String, DecoderError> {
        if sps.data.len() < 4 {
            return Err(DecoderError::InvalidData(
                "SPS too short for codec string".to_string(),
            ));
        }
        Ok(format!(
            "avc1.{:02X}{:02X}{:02X}",
            sps.data[1], sps.data[2], sps.data[3]
        ))
    }

    /// Decoder configuration payload: SPS and PPS with start codes
    fn config_payload(&self) -> bytes::Bytes {
        let mut out = BytesMut::new();
        for nal in [&self.sps, &self.pps].into_iter().flatten() {
            out.put_slice(&START_CODE);
            out.put_slice(&nal.data);
        }
        out.freeze()
    }

    fn track_config(&mut self, au: &AccessUnit) {
        if let Some(sps) = au.sps() {
            self.sps = Some(sps.clone());
        }
        if let Some(pps) = au.pps() {
            self.pps = Some(pps.clone());
        }
    }

    /// Turn one access unit into the chunks handed to the codec sink
    fn submit_unit(&mut self, au: AccessUnit) -> Result<Vec<MediaFrame>, DecoderError> {
        self.track_config(&au);

        let mut out = Vec::new();
        if self.awaiting_keyframe && !au.keyframe() {
            if self.reported_gap {
                log::debug!("Dropping delta chunk while waiting for keyframe");
                return Ok(out);
            }
            self.reported_gap = true;
            return Err(DecoderError::DecodeError(
                "Key frame required before delta frames".to_string(),
            ));
        }
        if au.keyframe() {
            self.awaiting_keyframe = false;
            self.reported_gap = false;
        }

        if !self.configured {
            let Some(sps) = self.sps.as_ref() else {
                self.awaiting_keyframe = true;
                return Err(DecoderError::DecodeError(
                    "Keyframe without SPS, cannot configure".to_string(),
                ));
            };
            let codec = Self::derive_codec_string(sps)?;
            log::info!("Configuring hardware codec sink: {}", codec);
            self.codec_string = Some(codec);
            self.configured = true;
            out.push(MediaFrame::init(DecoderType::Webcodecs, self.config_payload()));
        }

        let timestamp = self.next_timestamp;
        self.next_timestamp += self.frame_duration_ms;
        self.frame_count += 1;

        let data = au.to_annexb();
        out.push(if au.keyframe() {
            MediaFrame::key(DecoderType::Webcodecs, timestamp, data)
        } else {
            MediaFrame::delta(DecoderType::Webcodecs, timestamp, data)
        });
        Ok(out)
    }

    pub fn codec_string(&self) -> Option<&str> {
        self.codec_string.as_deref()
    }
}

impl Default for WebcodecsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeBackend for WebcodecsBackend {
    fn init(
        &mut self,
        config: &DecoderConfig,
        surface: &dyn RenderSurface,
    ) -> Result<(), DecoderError> {
        if !surface.supports(DecoderType::Webcodecs) {
            log::warn!("Surface has no hardware codec sink");
            return Err(DecoderError::HardwareNotAvailable);
        }

        self.frame_duration_ms = config.frame_duration_ms();
        self.next_timestamp = 0;
        self.frame_count = 0;
        self.configured = false;
        self.awaiting_keyframe = true;
        self.reported_gap = false;
        self.sps = None;
        self.pps = None;
        self.codec_string = None;
        self.splitter.reset();
        self.assembler.reset();

        log::info!(
            "Hardware decoder initialized: {}x{} @ {} fps",
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
            let nal = match self.splitter.next_unit() {
                Ok(Some(nal)) => nal,
                Ok(None) => break,
                Err(e) => {
                    self.assembler.reset();
                    if frames.is_empty() {
                        return Err(e);
                    }
                    log::warn!("Stream fault after {} good chunks: {}", frames.len(), e);
                    return Ok(frames);
                }
            };

            let Some(au) = self.assembler.push(nal) else {
                continue;
            };
            match self.submit_unit(au) {
                Ok(chunks) => frames.extend(chunks),
                Err(e) if frames.is_empty() => return Err(e),
                Err(e) => {
                    log::warn!("Dropping chunk: {}", e);
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
                if let Ok(chunks) = self.submit_unit(au) {
                    frames.extend(chunks);
                }
            }
        }
        if let Some(au) = self.assembler.flush() {
            if let Ok(chunks) = self.submit_unit(au) {
                frames.extend(chunks);
            }
        }
        frames
    }

    fn reset(&mut self) {
        self.splitter.reset();
        self.assembler.reset();
        // Keep the codec configuration; the sink resumes at the next keyframe
        self.configured = self.codec_string.is_some();
        self.awaiting_keyframe = true;
        self.reported_gap = false;
    }

    fn info(&self) -> &str {
        "webcodecs (hardware-accelerated)"
    }
}

#[cfg(test)]
mod tests {
    use super::super::FrameKind;
    use super::*;
    use crate::surface::SurfaceError;

    struct Surface {
        hardware: bool,
    }

    impl RenderSurface for Surface {
        fn supports(&self, decoder: DecoderType) -> bool {
            match decoder {
                DecoderType::Webcodecs => self.hardware,
                _ => true,
            }
        }
        fn submit(&self, _frame: MediaFrame) -> Result<(), SurfaceError> {
            Ok(())
        }
        fn clear(&self) {}
    }

    fn nal(nal_type: u8, body: &[u8]) -> Vec<u8> {
        let mut v = START_CODE.to_vec();
        v.push(nal_type);
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn test_fails_fast_without_hardware_sink() {
        let mut backend = WebcodecsBackend::new();
        let err = backend
            .init(&DecoderConfig::for_device(1), &Surface { hardware: false })
            .unwrap_err();
        assert!(matches!(err, DecoderError::HardwareNotAvailable));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_codec_string_from_sps() {
        let mut backend = WebcodecsBackend::new();
        backend
            .init(&DecoderConfig::for_device(1), &Surface { hardware: true })
            .unwrap();

        // Baseline profile 0x42, constraints 0xC0, level 0x1F
        let mut stream = Vec::new();
        stream.extend(nal(7, &[0x42, 0xC0, 0x1F, 0x8C]));
        stream.extend(nal(8, &[0xCE, 0x3C]));
        stream.extend(nal(5, &[0; 32]));
        stream.extend(nal(1, &[0; 16]));
        stream.extend(nal(1, &[0; 16]));

        let frames = backend.push(&stream).unwrap();
        assert_eq!(backend.codec_string(), Some("avc1.42C01F"));

        // Init payload precedes the first key chunk
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Init);
        assert_eq!(frames[1].kind, FrameKind::Key);
    }

    #[test]
    fn test_delta_before_keyframe_is_refused() {
        let mut backend = WebcodecsBackend::new();
        backend
            .init(&DecoderConfig::for_device(1), &Surface { hardware: true })
            .unwrap();

        let mut stream = Vec::new();
        stream.extend(nal(1, &[0; 16]));
        stream.extend(nal(1, &[0; 16]));
        stream.extend(nal(1, &[0; 16]));

        // Reported once, then dropped silently until the stream recovers
        let err = backend.push(&stream).unwrap_err();
        assert!(err.is_transient());

        // Recovers once a keyframe with config arrives
        let mut stream = Vec::new();
        stream.extend(nal(7, &[0x64, 0x00, 0x28, 0x11]));
        stream.extend(nal(8, &[0xEE]));
        stream.extend(nal(5, &[0; 32]));
        stream.extend(nal(1, &[0; 16]));
        stream.extend(nal(1, &[0; 16]));

        let frames = backend.push(&stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Init);
        assert!(frames[1].is_key());
        assert_eq!(backend.codec_string(), Some("avc1.640028"));
    }
}
