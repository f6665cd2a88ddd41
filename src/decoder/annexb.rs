// Annex-B stream parsing
// Incremental start-code splitter and access-unit assembly shared by the
// decoder back-ends

use super::DecoderError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 4-byte start code used when re-emitting NAL units
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit categories relevant to frame assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// Coded slice of a non-IDR picture
    Slice,
    /// Coded slice of an IDR picture (keyframe)
    Idr,
    Sei,
    Sps,
    Pps,
    /// Access unit delimiter
    Aud,
    Other(u8),
}

/// One NAL unit, without its start code
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Bytes,
}

impl NalUnit {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn nal_type(&self) -> u8 {
        self.data.first().map(|b| b & 0x1F).unwrap_or(0)
    }

    pub fn kind(&self) -> NalKind {
        match self.nal_type() {
            1..=4 => NalKind::Slice,
            5 => NalKind::Idr,
            6 => NalKind::Sei,
            7 => NalKind::Sps,
            8 => NalKind::Pps,
            9 => NalKind::Aud,
            t => NalKind::Other(t),
        }
    }

    /// Slice data of a coded picture
    pub fn is_vcl(&self) -> bool {
        matches!(self.kind(), NalKind::Slice | NalKind::Idr)
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind() == NalKind::Idr
    }
}

/// Incremental Annex-B splitter
///
/// Feeds arrive in arbitrary transport-sized pieces; a NAL unit is emitted
/// once the start code that terminates it has been seen. Bytes before the
/// first start code are discarded (a live stream may be joined mid-unit).
pub struct AnnexBSplitter {
    buffer: BytesMut,
    /// Set once the first start code has been found
    synced: bool,
}

impl Default for AnnexBSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            synced: false,
        }
    }

    /// Feed raw stream bytes into the splitter
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    /// Try to extract the next complete NAL unit
    ///
    /// A malformed unit (empty body or forbidden_zero_bit set) is discarded
    /// and reported as `InvalidData`; the splitter stays usable and the
    /// caller decides whether to resynchronize.
    pub fn next_unit(&mut self) -> Result<Option<NalUnit>, DecoderError> {
        if !self.synced {
            match find_start_code(&self.buffer) {
                Some((pos, len)) => {
                    if pos > 0 {
                        log::debug!("Skipping {} bytes before first start code", pos);
                    }
                    self.buffer.advance(pos + len);
                    self.synced = true;
                }
                None => {
                    // Keep at most a partial start code worth of tail
                    if self.buffer.len() > 3 {
                        let keep = self.buffer.len() - 3;
                        self.buffer.advance(keep);
                    }
                    return Ok(None);
                }
            }
        }

        // The unit ends where the next start code begins
        let Some((end, code_len)) = find_start_code(&self.buffer) else {
            return Ok(None);
        };

        let unit = self.buffer.split_to(end).freeze();
        self.buffer.advance(code_len);

        if unit.is_empty() {
            return Err(DecoderError::InvalidData("Empty NAL unit".to_string()));
        }
        if unit[0] & 0x80 != 0 {
            return Err(DecoderError::InvalidData(format!(
                "Corrupt NAL header: 0x{:02X}",
                unit[0]
            )));
        }

        Ok(Some(NalUnit::new(unit)))
    }

    /// Emit whatever remains in the buffer as a final unit, if valid
    pub fn flush_unit(&mut self) -> Option<NalUnit> {
        if !self.synced || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let unit = self.buffer.split().freeze();
        if unit[0] & 0x80 != 0 {
            return None;
        }
        Some(NalUnit::new(unit))
    }

    /// Drop buffered bytes and resynchronize at the next start code
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.synced = false;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the next 3- or 4-byte start code; returns (offset, code length)
fn find_start_code(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 3 {
        return None;
    }
    for i in 0..buf.len() - 2 {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if buf[i + 2] == 0 && buf.len() > i + 3 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
    }
    None
}

/// One coded picture with its attached configuration NALs
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nals: Vec<NalUnit>,
}

impl AccessUnit {
    pub fn keyframe(&self) -> bool {
        self.nals.iter().any(|n| n.is_keyframe())
    }

    pub fn sps(&self) -> Option<&NalUnit> {
        self.nals.iter().find(|n| n.kind() == NalKind::Sps)
    }

    pub fn pps(&self) -> Option<&NalUnit> {
        self.nals.iter().find(|n| n.kind() == NalKind::Pps)
    }

    /// Re-serialize the unit with 4-byte start codes
    pub fn to_annexb(&self) -> Bytes {
        let total: usize = self
            .nals
            .iter()
            .map(|n| START_CODE.len() + n.data.len())
            .sum();
        let mut out = BytesMut::with_capacity(total);
        for nal in &self.nals {
            out.put_slice(&START_CODE);
            out.put_slice(&nal.data);
        }
        out.freeze()
    }

    pub fn size(&self) -> usize {
        self.nals.iter().map(|n| n.data.len()).sum()
    }
}

/// Groups NAL units into access units
///
/// One coded picture per unit: the next NAL after a picture's slice data
/// closes the unit. Configuration NALs (SPS/PPS/SEI) attach to the picture
/// that follows them.
#[derive(Default)]
pub struct AccessUnitAssembler {
    current: Vec<NalUnit>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one NAL; returns a completed access unit when a boundary is found
    ///
    /// A unit that already holds a picture is closed by whatever follows it;
    /// pending configuration NALs stay attached to the picture they precede.
    pub fn push(&mut self, nal: NalUnit) -> Option<AccessUnit> {
        let done = if self.current.iter().any(|n| n.is_vcl()) {
            self.take()
        } else {
            None
        };
        self.current.push(nal);
        done
    }

    /// Complete the in-progress unit, if it holds a picture
    pub fn flush(&mut self) -> Option<AccessUnit> {
        if self.current.iter().any(|n| n.is_vcl()) {
            self.take()
        } else {
            self.current.clear();
            None
        }
    }

    pub fn reset(&mut self) {
        self.current.clear();
    }

    fn take(&mut self) -> Option<AccessUnit> {
        if self.current.is_empty() {
            return None;
        }
        Some(AccessUnit {
            nals: std::mem::take(&mut self.current),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(nal_type: u8, len: usize) -> Vec<u8> {
        let mut v = vec![nal_type];
        v.extend(std::iter::repeat(0xAA).take(len));
        v
    }

    fn annexb(units: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(u);
        }
        out
    }

    fn drain(splitter: &mut AnnexBSplitter) -> Vec<NalUnit> {
        let mut out = Vec::new();
        while let Ok(Some(u)) = splitter.next_unit() {
            out.push(u);
        }
        out
    }

    #[test]
    fn test_split_whole_stream() {
        let stream = annexb(&[nal(7, 4), nal(8, 2), nal(5, 16)]);
        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&stream);

        let units = drain(&mut splitter);
        // The last unit stays buffered until the next start code arrives
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind(), NalKind::Sps);
        assert_eq!(units[1].kind(), NalKind::Pps);

        let last = splitter.flush_unit().unwrap();
        assert_eq!(last.kind(), NalKind::Idr);
        assert!(last.is_keyframe());
    }

    #[test]
    fn test_split_across_feeds() {
        let stream = annexb(&[nal(7, 8), nal(1, 32)]);
        let mut splitter = AnnexBSplitter::new();

        // Feed one byte at a time, splitting start codes across chunks
        let mut units = Vec::new();
        for b in &stream {
            splitter.feed(&[*b]);
            units.extend(drain(&mut splitter));
        }
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind(), NalKind::Sps);
        assert_eq!(units[0].data.len(), 9);

        let last = splitter.flush_unit().unwrap();
        assert_eq!(last.kind(), NalKind::Slice);
    }

    #[test]
    fn test_three_byte_start_codes() {
        let mut stream = vec![0, 0, 1];
        stream.extend(nal(7, 4));
        stream.extend([0, 0, 1]);
        stream.extend(nal(5, 4));
        stream.extend([0, 0, 1]);

        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&stream);
        let units = drain(&mut splitter);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind(), NalKind::Sps);
        assert_eq!(units[1].kind(), NalKind::Idr);
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend(annexb(&[nal(7, 4), nal(8, 2)]));

        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&stream);
        let units = drain(&mut splitter);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind(), NalKind::Sps);
    }

    #[test]
    fn test_corrupt_unit_reported_and_recovered() {
        let stream = annexb(&[vec![0x80, 1, 2], nal(5, 4), nal(1, 4)]);
        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&stream);

        // Forbidden bit set: reported, then parsing continues
        assert!(matches!(
            splitter.next_unit(),
            Err(DecoderError::InvalidData(_))
        ));
        let unit = splitter.next_unit().unwrap().unwrap();
        assert_eq!(unit.kind(), NalKind::Idr);
    }

    #[test]
    fn test_access_unit_assembly() {
        let mut asm = AccessUnitAssembler::new();
        let to_nal = |v: Vec<u8>| NalUnit::new(Bytes::from(v));

        assert!(asm.push(to_nal(nal(7, 4))).is_none());
        assert!(asm.push(to_nal(nal(8, 2))).is_none());
        assert!(asm.push(to_nal(nal(5, 16))).is_none());

        // Next picture closes the keyframe AU
        let au = asm.push(to_nal(nal(1, 16))).unwrap();
        assert!(au.keyframe());
        assert_eq!(au.nals.len(), 3);
        assert!(au.sps().is_some());
        assert!(au.pps().is_some());

        let au = asm.flush().unwrap();
        assert!(!au.keyframe());
        assert_eq!(au.nals.len(), 1);
    }

    #[test]
    fn test_access_unit_delimiter_boundary() {
        let mut asm = AccessUnitAssembler::new();
        let to_nal = |v: Vec<u8>| NalUnit::new(Bytes::from(v));

        assert!(asm.push(to_nal(nal(9, 1))).is_none());
        assert!(asm.push(to_nal(nal(5, 8))).is_none());
        let au = asm.push(to_nal(nal(9, 1))).unwrap();
        assert!(au.keyframe());

        let annexb = au.to_annexb();
        // AUD + IDR with 4-byte start codes
        assert_eq!(annexb.len(), 4 + 2 + 4 + 9);
    }
}
