// Media-source back-end
// Packages the stream as an init segment plus batched media segments with a
// bounded pending buffer; a live view evicts oldest rather than stall

use super::annexb::{AccessUnit, AccessUnitAssembler, AnnexBSplitter, NalUnit, START_CODE};
use super::{DecodeBackend, DecoderConfig, DecoderError, DecoderType, MediaFrame};
use crate::surface::RenderSurface;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Media segment duration target
const SEGMENT_TARGET_MS: u64 = 500;

/// Pending buffer budget before oldest-first eviction kicks in
const MAX_PENDING_BYTES: usize = 2 * 1024 * 1024;

pub struct MseBackend {
    splitter: AnnexBSplitter,
    assembler: AccessUnitAssembler,
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
    sent_init: bool,
    /// Appending starts at a keyframe, at the stream head and after reset
    awaiting_keyframe: bool,
    /// Access units batched for the segment under construction
    pending: VecDeque<(AccessUnit, u64)>,
    pending_bytes: usize,
    segment_target_ms: u64,
    max_pending_bytes: usize,
    frame_duration_ms: u64,
    next_timestamp: u64,
    segment_count: u64,
    evicted: u64,
}

impl MseBackend {
    pub fn new() -> Self {
        Self::with_limits(SEGMENT_TARGET_MS, MAX_PENDING_BYTES)
    }

    /// Buffer tuning for embedders with tighter latency or memory targets
    pub fn with_limits(segment_target_ms: u64, max_pending_bytes: usize) -> Self {
        Self {
            splitter: AnnexBSplitter::new(),
            assembler: AccessUnitAssembler::new(),
            sps: None,
            pps: None,
            sent_init: false,
            awaiting_keyframe: true,
            pending: VecDeque::new(),
            pending_bytes: 0,
            segment_target_ms,
            max_pending_bytes,
            frame_duration_ms: 33,
            next_timestamp: 0,
            segment_count: 0,
            evicted: 0,
        }
    }

    /// Units dropped by the eviction budget so far
    pub fn evicted_units(&self) -> u64 {
        self.evicted
    }

    fn init_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in [&self.sps, &self.pps].into_iter().flatten() {
            out.put_slice(&START_CODE);
            out.put_slice(&nal.data);
        }
        out.freeze()
    }

    /// Buffer one access unit, emitting frames when a segment completes
    fn append(&mut self, au: AccessUnit) -> Result<Vec<MediaFrame>, DecoderError> {
        if let Some(sps) = au.sps() {
            self.sps = Some(sps.clone());
        }
        if let Some(pps) = au.pps() {
            self.pps = Some(pps.clone());
        }

        if au.size() > self.max_pending_bytes {
            return Err(DecoderError::DecodeError(format!(
                "Access unit of {} bytes exceeds buffer budget",
                au.size()
            )));
        }

        if self.awaiting_keyframe {
            if !au.keyframe() {
                log::debug!("Dropping access unit while waiting for keyframe");
                return Ok(Vec::new());
            }
            self.awaiting_keyframe = false;
        }

        let mut out = Vec::new();
        if !self.sent_init {
            if self.sps.is_none() || self.pps.is_none() {
                self.awaiting_keyframe = true;
                return Err(DecoderError::DecodeError(
                    "Keyframe without SPS/PPS, cannot build init segment".to_string(),
                ));
            }
            log::info!("Emitting media-source init segment");
            out.push(MediaFrame::init(DecoderType::Mse, self.init_payload()));
            self.sent_init = true;
        }

        let timestamp = self.next_timestamp;
        self.next_timestamp += self.frame_duration_ms;
        self.pending_bytes += au.size();
        self.pending.push_back((au, timestamp));

        // Live view: over budget, drop oldest instead of stalling
        while self.pending_bytes > self.max_pending_bytes {
            if let Some((old, _)) = self.pending.pop_front() {
                self.pending_bytes -= old.size();
                self.evicted += 1;
                log::warn!("Evicting buffered unit, {} bytes pending", self.pending_bytes);
            }
        }

        let buffered_ms = self.pending.len() as u64 * self.frame_duration_ms;
        if buffered_ms >= self.segment_target_ms {
            if let Some(segment) = self.build_segment() {
                out.push(segment);
            }
        }
        Ok(out)
    }

    /// Concatenate the pending units into one media segment
    fn build_segment(&mut self) -> Option<MediaFrame> {
        let (_, first_ts) = self.pending.front()?;
        let timestamp = *first_ts;
        let keyframe = self.pending.iter().any(|(au, _)| au.keyframe());

        let mut data = BytesMut::with_capacity(self.pending_bytes);
        for (au, _) in self.pending.drain(..) {
            data.put_slice(&au.to_annexb());
        }
        self.pending_bytes = 0;
        self.segment_count += 1;

        let data = data.freeze();
        Some(if keyframe {
            MediaFrame::key(DecoderType::Mse, timestamp, data)
        } else {
            MediaFrame::delta(DecoderType::Mse, timestamp, data)
        })
    }
}

impl Default for MseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeBackend for MseBackend {
    fn init(
        &mut self,
        config: &DecoderConfig,
        surface: &dyn RenderSurface,
    ) -> Result<(), DecoderError> {
        if !surface.supports(DecoderType::Mse) {
            return Err(DecoderError::InitError(
                "Surface has no media-source sink".to_string(),
            ));
        }

        self.frame_duration_ms = config.frame_duration_ms();
        self.next_timestamp = 0;
        self.sent_init = false;
        self.awaiting_keyframe = true;
        self.sps = None;
        self.pps = None;
        self.pending.clear();
        self.pending_bytes = 0;
        self.segment_count = 0;
        self.evicted = 0;
        self.splitter.reset();
        self.assembler.reset();

        log::info!(
            "Media-source decoder initialized: {}x{} @ {} fps, {}ms segments",
            config.width,
            config.height,
            config.fps_hint,
            self.segment_target_ms
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
                    self.awaiting_keyframe = true;
                    if frames.is_empty() {
                        return Err(e);
                    }
                    log::warn!("Stream fault after {} good segments: {}", frames.len(), e);
                    return Ok(frames);
                }
            };

            let Some(au) = self.assembler.push(nal) else {
                continue;
            };
            match self.append(au) {
                Ok(produced) => frames.extend(produced),
                Err(e) if frames.is_empty() => return Err(e),
                Err(e) => {
                    log::warn!("Dropping access unit: {}", e);
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
                if let Ok(produced) = self.append(au) {
                    frames.extend(produced);
                }
            }
        }
        if let Some(au) = self.assembler.flush() {
            if let Ok(produced) = self.append(au) {
                frames.extend(produced);
            }
        }
        if let Some(segment) = self.build_segment() {
            frames.push(segment);
        }
        frames
    }

    fn reset(&mut self) {
        self.splitter.reset();
        self.assembler.reset();
        self.pending.clear();
        self.pending_bytes = 0;
        // The source buffer keeps its configuration; appending resumes at a keyframe
        self.awaiting_keyframe = true;
    }

    fn info(&self) -> &str {
        "mse (media-source)"
    }
}

#[cfg(test)]
mod tests {
    use super::super::FrameKind;
    use super::*;
    use crate::surface::SurfaceError;

    struct AnySurface;

    impl RenderSurface for AnySurface {
        fn supports(&self, _decoder: DecoderType) -> bool {
            true
        }
        fn submit(&self, _frame: MediaFrame) -> Result<(), SurfaceError> {
            Ok(())
        }
        fn clear(&self) {}
    }

    fn nal(nal_type: u8, len: usize) -> Vec<u8> {
        let mut v = START_CODE.to_vec();
        v.push(nal_type);
        v.extend(std::iter::repeat(0x42).take(len));
        v
    }

    fn init_backend(backend: &mut MseBackend, fps: u32) {
        let config = DecoderConfig {
            fps_hint: fps,
            ..DecoderConfig::for_device(1)
        };
        backend.init(&config, &AnySurface).unwrap();
    }

    #[test]
    fn test_init_segment_precedes_media() {
        // 10 fps, 300ms target: a segment every 3 access units
        let mut backend = MseBackend::with_limits(300, MAX_PENDING_BYTES);
        init_backend(&mut backend, 10);

        let mut stream = Vec::new();
        stream.extend(nal(7, 8));
        stream.extend(nal(8, 4));
        stream.extend(nal(5, 64));
        for _ in 0..4 {
            stream.extend(nal(1, 32));
        }

        let frames = backend.push(&stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Init);
        // First segment starts at the keyframe
        assert_eq!(frames[1].kind, FrameKind::Key);
        assert_eq!(frames[1].timestamp, 0);

        // Init payload is exactly the SPS and PPS
        assert_eq!(frames[0].data.len(), 4 + 9 + 4 + 5);
    }

    #[test]
    fn test_segments_batch_by_duration() {
        let mut backend = MseBackend::with_limits(300, MAX_PENDING_BYTES);
        init_backend(&mut backend, 10);

        let mut stream = Vec::new();
        stream.extend(nal(7, 8));
        stream.extend(nal(8, 4));
        stream.extend(nal(5, 64));
        for _ in 0..6 {
            stream.extend(nal(1, 32));
        }

        let mut frames = backend.push(&stream).unwrap();
        frames.extend(backend.flush());

        // Init, the keyframe segment, a delta segment, and the flushed tail
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].kind, FrameKind::Init);
        assert_eq!(frames[1].kind, FrameKind::Key);
        assert_eq!(frames[2].kind, FrameKind::Delta);
        assert_eq!(frames[3].kind, FrameKind::Delta);
        // Segment timestamps advance by the batched duration
        assert_eq!(frames[1].timestamp, 0);
        assert_eq!(frames[2].timestamp, 300);
        assert_eq!(frames[3].timestamp, 600);
    }

    #[test]
    fn test_eviction_keeps_live_edge() {
        // Tiny budget: three ~37-byte units overflow 100 bytes
        let mut backend = MseBackend::with_limits(10_000, 100);
        init_backend(&mut backend, 10);

        let mut stream = Vec::new();
        stream.extend(nal(7, 8));
        stream.extend(nal(8, 4));
        stream.extend(nal(5, 32));
        for _ in 0..4 {
            stream.extend(nal(1, 32));
        }

        let frames = backend.push(&stream).unwrap();
        // Only the init segment made it out; media is still batching
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Init);
        assert!(backend.evicted_units() > 0);

        // The flushed segment holds only the surviving tail
        let frames = backend.flush();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.len() <= 100 + 3 * START_CODE.len());
    }

    #[test]
    fn test_oversized_unit_is_transient() {
        let mut backend = MseBackend::with_limits(10_000, 100);
        init_backend(&mut backend, 10);

        let mut stream = Vec::new();
        stream.extend(nal(7, 8));
        stream.extend(nal(8, 4));
        stream.extend(nal(5, 256)); // exceeds the 100-byte budget on its own
        stream.extend(nal(1, 16));
        stream.extend(nal(1, 16));

        let err = backend.push(&stream).unwrap_err();
        assert!(err.is_transient());
    }
}
