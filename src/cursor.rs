//! Forward-only big-endian reading and writing over byte buffers.
//!
//! [SliceCursor] reads out of a borrowed slice and fails with [PsdError::Truncated] instead of reading past the end. [ByteWriter] appends to an owned buffer and supports writing a placeholder length and filling it in once the content after it is known.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{PsdError, Result};

#[derive(Clone, Debug, Default)]
pub struct SliceCursor<'a>
{
    pub (crate) buf : &'a [u8],
    pub (crate) pos : usize,
}

impl<'a> SliceCursor<'a>
{
    pub fn new(buf : &'a [u8]) -> Self
    {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize { self.pos }
    pub fn remaining(&self) -> usize { self.buf.len().saturating_sub(self.pos) }
    pub fn is_empty(&self) -> bool { self.remaining() == 0 }

    fn truncated(&self, needed : usize) -> PsdError
    {
        PsdError::Truncated { needed, available : self.remaining() }
    }

    /// Borrow the next `n` bytes and step over them.
    pub fn read_bytes(&mut self, n : usize) -> Result<&'a [u8]>
    {
        if n > self.remaining()
        {
            return Err(self.truncated(n));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Step over `n` bytes without looking at them.
    pub fn skip(&mut self, n : usize) -> Result<()>
    {
        self.read_bytes(n).map(|_| ())
    }

    /// Split off a cursor over the next `n` bytes and step over them.
    pub fn take(&mut self, n : usize) -> Result<SliceCursor<'a>>
    {
        Ok(SliceCursor::new(self.read_bytes(n)?))
    }

    pub fn read_u8(&mut self) -> Result<u8>
    {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16>
    {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16>
    {
        Ok(BigEndian::read_i16(self.read_bytes(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32>
    {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32>
    {
        Ok(BigEndian::read_i32(self.read_bytes(4)?))
    }

    pub fn read_b4(&mut self) -> Result<[u8; 4]>
    {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(buf)
    }

    /// Read a length byte and that many Latin-1 bytes, then skip the padding that makes the whole thing a multiple of `pad_to` bytes long.
    ///
    /// A zero length reads as `None`.
    pub fn read_pascal_string(&mut self, pad_to : usize) -> Result<Option<String>>
    {
        let len = self.read_u8()? as usize;
        let text = self.read_bytes(len)?;
        self.skip(padding(len + 1, pad_to))?;
        if len == 0
        {
            return Ok(None);
        }
        Ok(Some(text.iter().map(|&b| b as char).collect()))
    }
}

/// Bytes needed to round `len` up to a multiple of `pad_to`.
pub (crate) fn padding(len : usize, pad_to : usize) -> usize
{
    if pad_to <= 1
    {
        return 0;
    }
    (pad_to - len % pad_to) % pad_to
}

/// Latin-1 bytes for a string, with anything outside Latin-1 replaced by `?`, cut to 255 bytes.
pub (crate) fn latin1_bytes(text : &str) -> Vec<u8>
{
    text.chars()
        .map(|c| if (c as u32) < 256 { c as u32 as u8 } else { b'?' })
        .take(255)
        .collect()
}

/// Position of a four-byte slot reserved by [ByteWriter::placeholder_u32], waiting to be filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Placeholder(usize);

impl Placeholder
{
    /// Where the content after the placeholder starts.
    pub fn content_start(self) -> usize { self.0 + 4 }
}

/// Appending big-endian writer.
#[derive(Debug, Default)]
pub struct ByteWriter
{
    buf : Vec<u8>,
}

impl ByteWriter
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn position(&self) -> usize { self.buf.len() }

    pub fn into_inner(self) -> Vec<u8> { self.buf }

    pub fn as_bytes(&self) -> &[u8] { &self.buf }

    pub fn write_bytes(&mut self, bytes : &[u8]) -> Result<()>
    {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_zeros(&mut self, n : usize) -> Result<()>
    {
        self.buf.resize(self.buf.len() + n, 0);
        Ok(())
    }

    pub fn write_u8(&mut self, v : u8) -> Result<()>
    {
        Ok(self.buf.write_u8(v)?)
    }

    pub fn write_u16(&mut self, v : u16) -> Result<()>
    {
        Ok(self.buf.write_u16::<BigEndian>(v)?)
    }

    pub fn write_i16(&mut self, v : i16) -> Result<()>
    {
        Ok(self.buf.write_i16::<BigEndian>(v)?)
    }

    pub fn write_u32(&mut self, v : u32) -> Result<()>
    {
        Ok(self.buf.write_u32::<BigEndian>(v)?)
    }

    pub fn write_i32(&mut self, v : i32) -> Result<()>
    {
        Ok(self.buf.write_i32::<BigEndian>(v)?)
    }

    /// Write a length byte plus Latin-1 content, zero-padded so the total is a multiple of `pad_to`.
    pub fn write_pascal_string(&mut self, text : &str, pad_to : usize) -> Result<()>
    {
        let bytes = latin1_bytes(text);
        self.write_u8(bytes.len() as u8)?;
        self.write_bytes(&bytes)?;
        self.write_zeros(padding(bytes.len() + 1, pad_to))
    }

    /// Reserve four bytes to be filled in later with [ByteWriter::patch_u32].
    pub fn placeholder_u32(&mut self) -> Result<Placeholder>
    {
        let at = self.position();
        self.write_u32(0)?;
        Ok(Placeholder(at))
    }

    /// Overwrite a reserved slot. The write position stays at the end of the buffer.
    pub fn patch_u32(&mut self, slot : Placeholder, value : u32)
    {
        BigEndian::write_u32(&mut self.buf[slot.0..slot.0 + 4], value);
    }

    /// Byte count written since the slot, not counting the slot itself.
    pub fn len_since(&self, slot : Placeholder) -> usize
    {
        self.position() - slot.content_start()
    }

    /// Write a u32 length, then the content produced by `body`, then go back and store the content's real length in the u32.
    ///
    /// `pad_to` rounds the content up with zero bytes before the length is taken.
    pub fn length_prefixed<F>(&mut self, pad_to : usize, body : F) -> Result<()>
    where
        F : FnOnce(&mut Self) -> Result<()>,
    {
        let slot = self.placeholder_u32()?;
        body(self)?;
        self.write_zeros(padding(self.len_since(slot), pad_to))?;
        let len = self.len_since(slot);
        let len = u32::try_from(len).map_err(|_| PsdError::InvalidDocument(format!("section of {} bytes does not fit a 32-bit length", len)))?;
        self.patch_u32(slot, len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian()
    {
        let data = [0x12, 0x34, 0xFF, 0xFE, 0x00, 0x00, 0x01, 0x00, 0x7F];
        let mut c = SliceCursor::new(&data);
        assert_eq!(c.read_u16().unwrap(), 0x1234);
        assert_eq!(c.read_i16().unwrap(), -2);
        assert_eq!(c.read_u32().unwrap(), 256);
        assert_eq!(c.read_u8().unwrap(), 0x7F);
        assert!(c.is_empty());
    }

    #[test]
    fn truncation_is_an_error()
    {
        let data = [1, 2, 3];
        let mut c = SliceCursor::new(&data);
        match c.read_u32()
        {
            Err(PsdError::Truncated { needed : 4, available : 3 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        // a failed read consumes nothing
        assert_eq!(c.position(), 0);
        assert!(c.skip(4).is_err());
        assert!(c.skip(3).is_ok());
    }

    #[test]
    fn pascal_strings_pad()
    {
        let mut w = ByteWriter::new();
        w.write_pascal_string("abc", 4).unwrap();
        w.write_pascal_string("ab", 4).unwrap();
        w.write_pascal_string("", 2).unwrap();
        assert_eq!(w.as_bytes(), &[3, b'a', b'b', b'c', 2, b'a', b'b', 0, 0, 0]);

        let bytes = w.into_inner();
        let mut c = SliceCursor::new(&bytes);
        assert_eq!(c.read_pascal_string(4).unwrap().as_deref(), Some("abc"));
        assert_eq!(c.read_pascal_string(4).unwrap().as_deref(), Some("ab"));
        assert_eq!(c.read_pascal_string(2).unwrap(), None);
        assert!(c.is_empty());
    }

    #[test]
    fn pascal_strings_are_latin1()
    {
        let mut w = ByteWriter::new();
        w.write_pascal_string("caf\u{e9}\u{4e16}", 1).unwrap();
        assert_eq!(w.as_bytes(), &[5, b'c', b'a', b'f', 0xE9, b'?']);
        let bytes = w.into_inner();
        assert_eq!(SliceCursor::new(&bytes).read_pascal_string(1).unwrap().as_deref(), Some("caf\u{e9}?"));
    }

    #[test]
    fn nested_back_patching()
    {
        let mut w = ByteWriter::new();
        w.length_prefixed(1, |w| {
            w.write_u16(7)?;
            w.length_prefixed(4, |w| w.write_u8(1))
        }).unwrap();
        assert_eq!(w.as_bytes(), &[0, 0, 0, 10, 0, 7, 0, 0, 0, 4, 1, 0, 0, 0]);
    }
}
