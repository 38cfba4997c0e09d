//! Framed item codec.
//!
//! Messages are a flat concatenation of items with no outer framing of their
//! own (the transport preserves message boundaries). An item is either a
//! NUL-terminated string or the raw little-endian bytes of a fixed-width
//! value. There are no type tags in the stream: the codec is position-typed,
//! so the tag string that was matched dictates the schema of what follows.

use thiserror::Error;

/// Decoding failures. A failed read drops the message; the connection that
/// carried it stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A fixed-width read ran past the end of the message.
    #[error("short read: needed {needed} bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },

    /// A string item had no terminator or was not valid UTF-8.
    #[error("bad string encoding at offset {at}")]
    BadString { at: usize },
}

/// A fixed-width value with a defined wire form.
pub trait Value: Copy + Sized {
    const SIZE: usize;
    fn put(&self, out: &mut Vec<u8>);
    fn take(bytes: &[u8]) -> Self;
}

macro_rules! impl_value {
    ($($ty:ty),* $(,)?) => {$(
        impl Value for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn put(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn take(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..core::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }
        }

        impl Encode for $ty {
            fn encode(&self, chunk: &mut Chunk) {
                chunk.put(*self);
            }
        }
    )*};
}

impl_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Anything that can be appended to a [`Chunk`] with its natural rule:
/// strings NUL-terminated, chunks concatenated, values raw.
pub trait Encode {
    fn encode(&self, chunk: &mut Chunk);
}

impl Encode for str {
    fn encode(&self, chunk: &mut Chunk) {
        chunk.put_str(self);
    }
}

impl Encode for &str {
    fn encode(&self, chunk: &mut Chunk) {
        chunk.put_str(self);
    }
}

impl Encode for String {
    fn encode(&self, chunk: &mut Chunk) {
        chunk.put_str(self);
    }
}

impl Encode for Chunk {
    fn encode(&self, chunk: &mut Chunk) {
        chunk.put_chunk(self);
    }
}

/// Growable message writer.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    bytes: Vec<u8>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string item: the raw bytes plus a single NUL terminator.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self
    }

    /// Append a fixed-width value item.
    pub fn put<V: Value>(&mut self, value: V) -> &mut Self {
        value.put(&mut self.bytes);
        self
    }

    /// Append a copy of another chunk's bytes. Plain concatenation, no
    /// length prefix.
    pub fn put_chunk(&mut self, other: &Chunk) -> &mut Self {
        self.bytes.extend_from_slice(&other.bytes);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Build a [`Chunk`] from a sequence of items, appending each with its
/// natural rule.
///
/// ```
/// use ensemble::chunk;
/// let message = chunk!["~", "Ping", "host.local.", 8001u16];
/// ```
#[macro_export]
macro_rules! chunk {
    ($($item:expr),* $(,)?) => {{
        let mut c = $crate::codec::Chunk::new();
        $( $crate::codec::Encode::encode(&$item, &mut c); )*
        c
    }};
}

/// Cursor-tracking message reader.
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read a fixed-width value and advance the cursor.
    pub fn get<V: Value>(&mut self) -> Result<V, CodecError> {
        if self.remaining() < V::SIZE {
            return Err(CodecError::ShortRead {
                needed: V::SIZE,
                remaining: self.remaining(),
            });
        }
        let value = V::take(&self.data[self.pos..]);
        self.pos += V::SIZE;
        Ok(value)
    }

    /// Read a string item and advance the cursor past its terminator.
    pub fn get_str(&mut self) -> Result<&'a str, CodecError> {
        let (s, end) = self.peek_str()?;
        self.pos = end;
        Ok(s)
    }

    /// If the next item is a string equal to `tag`, consume it and return
    /// true. Otherwise leave the cursor untouched and return false.
    pub fn is_next_tag(&mut self, tag: &str) -> bool {
        match self.peek_str() {
            Ok((s, end)) if s == tag => {
                self.pos = end;
                true
            }
            _ => false,
        }
    }

    fn peek_str(&self) -> Result<(&'a str, usize), CodecError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::BadString { at: self.pos })?;
        let s = core::str::from_utf8(&rest[..nul])
            .map_err(|_| CodecError::BadString { at: self.pos })?;
        Ok((s, self.pos + nul + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_items() {
        let mut c = Chunk::new();
        c.put_str("~")
            .put_str("Negotiate")
            .put_str("alpha.local.")
            .put(8001u16)
            .put(3i32)
            .put(1.5f64);

        let mut s = Stream::new(c.as_bytes());
        assert!(s.is_next_tag("~"));
        assert!(s.is_next_tag("Negotiate"));
        assert_eq!(s.get_str().unwrap(), "alpha.local.");
        assert_eq!(s.get::<u16>().unwrap(), 8001);
        assert_eq!(s.get::<i32>().unwrap(), 3);
        assert_eq!(s.get::<f64>().unwrap(), 1.5);
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn chunk_macro_matches_manual_build() {
        let manual = {
            let mut c = Chunk::new();
            c.put_str("-").put_str("Sync").put(0.25f64);
            c
        };
        let built = chunk!["-", "Sync", 0.25f64];
        assert_eq!(manual.as_bytes(), built.as_bytes());
    }

    #[test]
    fn tag_mismatch_leaves_cursor() {
        let c = chunk!["Switch", "host.local.", 8001u16];
        let mut s = Stream::new(c.as_bytes());
        assert!(!s.is_next_tag("Confirm"));
        assert_eq!(s.tell(), 0);
        // Idempotent on mismatch: asking again changes nothing.
        assert!(!s.is_next_tag("Confirm"));
        assert!(s.is_next_tag("Switch"));
        assert_eq!(s.get_str().unwrap(), "host.local.");
    }

    #[test]
    fn chunk_concatenation_is_flat() {
        let inner = chunk!["beta.local.", 8001u16, 250u32];
        let outer = chunk!["Peers", 1i32, inner];

        let mut s = Stream::new(outer.as_bytes());
        assert!(s.is_next_tag("Peers"));
        assert_eq!(s.get::<i32>().unwrap(), 1);
        assert_eq!(s.get_str().unwrap(), "beta.local.");
        assert_eq!(s.get::<u16>().unwrap(), 8001);
        assert_eq!(s.get::<u32>().unwrap(), 250);
    }

    #[test]
    fn short_read_reports_error() {
        let c = chunk![7u16];
        let mut s = Stream::new(c.as_bytes());
        assert_eq!(s.get::<u16>().unwrap(), 7);
        let err = s.get::<u32>().unwrap_err();
        assert_eq!(
            err,
            CodecError::ShortRead {
                needed: 4,
                remaining: 0
            }
        );
    }

    #[test]
    fn unterminated_string_reports_error() {
        let bytes = b"no-terminator";
        let mut s = Stream::new(bytes);
        assert!(matches!(s.get_str(), Err(CodecError::BadString { at: 0 })));
        // Cursor untouched after the failure.
        assert_eq!(s.tell(), 0);
    }

    #[test]
    fn values_are_little_endian() {
        let c = chunk![0x0102u16, 0x01020304u32];
        assert_eq!(c.as_bytes(), &[0x02, 0x01, 0x04, 0x03, 0x02, 0x01]);
    }
}
