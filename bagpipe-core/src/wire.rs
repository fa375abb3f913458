//! Wire primitives: TL cursor reader/writer and the length-prefixed session frame.
//!
//! TL values are little-endian. `bytes`/`string` use a 1-byte length (or `0xFE` + 3-byte
//! length for 254 bytes and more) and are padded so the whole field is 4-byte aligned.

use crate::cell::CellError;

/// `boolTrue = Bool`
pub const BOOL_TRUE: u32 = 0x997275b5;
/// `boolFalse = Bool`
pub const BOOL_FALSE: u32 = 0xbc799737;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
const LONG_BYTES_MARKER: u8 = 254;
const MAX_BYTES_LEN: usize = 0x00ff_ffff;

/// Decode failure. Never retried; propagated as-is to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of data reading {0}")]
    UnexpectedEof(&'static str),
    #[error("too short data to parse {what}: need {need} bytes, got {got}")]
    TooShort {
        what: &'static str,
        need: usize,
        got: usize,
    },
    #[error("unknown constructor 0x{0:08x}")]
    UnknownConstructor(u32),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid bytes length prefix")]
    InvalidLength,
    #[error("{0} bytes do not fit a TL length")]
    TooLong(usize),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("cell: {0}")]
    Cell(#[from] CellError),
}

/// Sequential little-endian reader over a TL buffer.
#[derive(Debug)]
pub struct TlReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Fails if anything is left unread.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining_len() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn read_raw(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        if self.remaining_len() < len {
            return Err(CodecError::UnexpectedEof(what));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], CodecError> {
        let raw = self.read_raw(N, what)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        self.read_array::<4>(what).map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32, CodecError> {
        self.read_array::<4>(what).map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        self.read_array::<8>(what).map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self, what: &'static str) -> Result<i64, CodecError> {
        self.read_array::<8>(what).map(i64::from_le_bytes)
    }

    /// IEEE-754 `double`, 8 bytes LE.
    pub fn read_double(&mut self, what: &'static str) -> Result<f64, CodecError> {
        self.read_array::<8>(what).map(f64::from_le_bytes)
    }

    pub fn read_int256(&mut self, what: &'static str) -> Result<[u8; 32], CodecError> {
        self.read_array::<32>(what)
    }

    /// Bool constructor; anything other than `boolTrue` reads as false.
    pub fn read_bool(&mut self, what: &'static str) -> Result<bool, CodecError> {
        Ok(self.read_u32(what)? == BOOL_TRUE)
    }

    pub fn read_bytes(&mut self, what: &'static str) -> Result<Vec<u8>, CodecError> {
        let first = self.read_raw(1, what)?[0];
        let (len, prefix) = match first {
            n if n < LONG_BYTES_MARKER => (n as usize, 1),
            LONG_BYTES_MARKER => {
                let l = self.read_raw(3, what)?;
                (
                    l[0] as usize | (l[1] as usize) << 8 | (l[2] as usize) << 16,
                    4,
                )
            }
            _ => return Err(CodecError::InvalidLength),
        };
        let value = self.read_raw(len, what)?.to_vec();
        let padding = (4 - (prefix + len) % 4) % 4;
        self.read_raw(padding, what)?;
        Ok(value)
    }

    pub fn read_string(&mut self, what: &'static str) -> Result<String, CodecError> {
        String::from_utf8(self.read_bytes(what)?).map_err(|_| CodecError::InvalidUtf8(what))
    }

    /// Bare vector: u32 count followed by `count` elements.
    pub fn read_vector<T>(
        &mut self,
        what: &'static str,
        mut read: impl FnMut(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Vec<T>, CodecError> {
        let count = self.read_u32(what)? as usize;
        // every element is at least 4 bytes; do not trust the count for preallocation
        let mut out = Vec::with_capacity(count.min(self.remaining_len() / 4));
        for _ in 0..count {
            out.push(read(self)?);
        }
        Ok(out)
    }
}

/// TL buffer builder. An oversized `bytes` value fails the whole buffer at `finish`.
#[derive(Debug, Default)]
pub struct TlWriter {
    data: Vec<u8>,
    too_long: Option<usize>,
}

impl TlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Result<Vec<u8>, CodecError> {
        match self.too_long {
            Some(len) => Err(CodecError::TooLong(len)),
            None => Ok(self.data),
        }
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_double(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_int256(&mut self, value: &[u8; 32]) {
        self.data.extend_from_slice(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(if value { BOOL_TRUE } else { BOOL_FALSE });
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        let len = value.len();
        if len > MAX_BYTES_LEN {
            self.too_long.get_or_insert(len);
            return;
        }
        let prefix = if len < LONG_BYTES_MARKER as usize {
            self.data.push(len as u8);
            1
        } else {
            self.data.push(LONG_BYTES_MARKER);
            self.data.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
            4
        };
        self.data.extend_from_slice(value);
        let padding = (4 - (prefix + len) % 4) % 4;
        self.data.extend(std::iter::repeat(0u8).take(padding));
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_vector<T>(&mut self, items: &[T], mut write: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            write(self, item);
        }
    }
}

/// Encode a payload into a single frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Length announced by a frame header.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    if header.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bytes_are_padded_to_four() {
        let mut w = TlWriter::new();
        w.write_bytes(b"abc");
        w.write_bytes(b"");
        w.write_bytes(b"abcd");
        let buf = w.finish().unwrap();
        assert_eq!(buf.len(), 4 + 4 + 8);
        assert_eq!(&buf[..4], &[3, b'a', b'b', b'c']);

        let mut r = TlReader::new(&buf);
        assert_eq!(r.read_bytes("a").unwrap(), b"abc");
        assert_eq!(r.read_bytes("b").unwrap(), b"");
        assert_eq!(r.read_bytes("c").unwrap(), b"abcd");
        r.finish().unwrap();
    }

    #[test]
    fn long_bytes_use_three_byte_length() {
        let value = vec![7u8; 300];
        let mut w = TlWriter::new();
        w.write_bytes(&value);
        let buf = w.finish().unwrap();
        assert_eq!(buf[0], 254);
        assert_eq!(&buf[1..4], &[0x2c, 0x01, 0x00]);
        assert_eq!(buf.len() % 4, 0);
        let mut r = TlReader::new(&buf);
        assert_eq!(r.read_bytes("long").unwrap(), value);
        r.finish().unwrap();
    }

    #[test]
    fn oversized_bytes_fail_the_buffer() {
        let mut w = TlWriter::new();
        w.write_bytes(&vec![0u8; MAX_BYTES_LEN + 1]);
        w.write_u32(1);
        assert_eq!(w.finish().unwrap_err(), CodecError::TooLong(MAX_BYTES_LEN + 1));

        let mut w = TlWriter::new();
        w.write_bytes(&vec![0u8; MAX_BYTES_LEN]);
        assert_eq!(w.finish().unwrap().len(), 4 + MAX_BYTES_LEN + 1);
    }

    #[test]
    fn bool_reads_only_true_constructor_as_true() {
        let mut w = TlWriter::new();
        w.write_bool(true);
        w.write_bool(false);
        w.write_u32(1);
        let buf = w.finish().unwrap();
        let mut r = TlReader::new(&buf);
        assert!(r.read_bool("t").unwrap());
        assert!(!r.read_bool("f").unwrap());
        assert!(!r.read_bool("junk").unwrap());
    }

    #[test]
    fn truncated_string_is_an_error() {
        let buf = [10u8, b'a', b'b'];
        let mut r = TlReader::new(&buf);
        assert_eq!(
            r.read_string("name"),
            Err(CodecError::UnexpectedEof("name"))
        );
    }

    #[test]
    fn invalid_length_prefix() {
        let buf = [255u8, 0, 0, 0];
        let mut r = TlReader::new(&buf);
        assert_eq!(r.read_bytes("x"), Err(CodecError::InvalidLength));
    }

    #[test]
    fn frame_partial_read_need_more() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(decode_frame(&frame[..2]), Err(FrameDecodeError::NeedMore));
        assert_eq!(decode_frame(&frame[..6]), Err(FrameDecodeError::NeedMore));
        let (payload, n) = decode_frame(&frame).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(n, frame.len());
    }

    #[test]
    fn frame_too_large_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert_eq!(frame_len(&header), Err(FrameDecodeError::TooLarge));
    }

    #[test]
    fn multiple_frames_back_to_back() {
        let mut buf = encode_frame(b"one").unwrap();
        buf.extend(encode_frame(b"second").unwrap());
        let (a, n) = decode_frame(&buf).unwrap();
        let (b, _) = decode_frame(&buf[n..]).unwrap();
        assert_eq!(a, b"one");
        assert_eq!(b, b"second");
    }
}
