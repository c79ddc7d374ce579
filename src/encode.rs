//! Serialize data into the bytecode protocol.
//!
//! Everything the protocol puts on the wire is big-endian: fixed-width
//! integers, i16-length-prefixed strings, i32-length-prefixed byte
//! strings and arrays, plus the varint family used inside record
//! batches.

use bytes::BufMut;

use crate::error::{Error, Result};

/// Render a value in its Kafka wire encoding.
pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

// Wire lengths are signed and narrower than usize; a length that does
// not fit its prefix type is an encoding fault, never a truncation.
fn checked_len<T: TryFrom<usize>>(len: usize) -> Result<T> {
    T::try_from(len).map_err(|_| Error::EncodingError)
}

macro_rules! fixed_width_to_byte {
    ($($int:ty => $put:ident),* $(,)?) => {
        $(
            impl ToByte for $int {
                fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
                    buffer.$put(*self);
                    Ok(())
                }
            }
        )*
    };
}

fixed_width_to_byte! {
    i8 => put_i8,
    i16 => put_i16,
    i32 => put_i32,
    u32 => put_u32,
    i64 => put_i64,
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(checked_len(self.len())?);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

// a nullable string renders None as an i16 length of -1
impl<'a> ToByte for Option<&'a str> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(value) => value.encode(buffer),
            None => (-1i16).encode(buffer),
        }
    }
}

// a byte string: i32 length, then the raw bytes
impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(checked_len(self.len())?);
        buffer.put(self);
        Ok(())
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, value| value.encode(buffer))
    }
}

/// Render `items` as a protocol array: an i32 count followed by each
/// element however `f` lays it down.
pub fn encode_as_array<T, F, W>(buffer: &mut W, items: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    buffer.put_i32(checked_len(items.len())?);
    for item in items {
        f(buffer, item)?;
    }
    Ok(())
}

/// Renders a slice of anything string-like as a protocol array of
/// strings.
pub struct AsStrings<'a, T>(pub &'a [T]);

impl<'a, T: AsRef<str> + 'a> ToByte for AsStrings<'a, T> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_as_array(buffer, self.0, |buffer, value| value.as_ref().encode(buffer))
    }
}

/// Render an unsigned LEB128 varint.
pub fn encode_varint<W: BufMut>(buffer: &mut W, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buffer.put_u8(byte);
        if value == 0 {
            return;
        }
    }
}

/// Render a zigzag signed varint, the record-level integer encoding of
/// the v2 record batch format.
pub fn encode_zigzag_varint<W: BufMut>(buffer: &mut W, value: i64) {
    encode_varint(buffer, ((value << 1) ^ (value >> 63)) as u64);
}
