use crate::error::{FaeError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// A cursor over an immutable byte slice, tracking how much has been
/// consumed so that callers can compute file offsets for relocation lookups
/// and diagnostics without threading a separate counter alongside it.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
    base: usize,
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader {
            data,
            base: 0,
            pos: 0,
        }
    }

    /// Builds a reader whose offsets are reported relative to `base` rather
    /// than zero, for sub-slices taken out of a larger section.
    pub fn with_base(data: &'a [u8], base: usize) -> Self {
        Reader { data, base, pos: 0 }
    }

    /// Bytes consumed so far, relative to the origin passed to `with_base`.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(FaeError::OutOfRange {
                offset: self.offset(),
                requested: n,
                available: self.data.len() - self.pos,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Reads an unsigned LEB128 value, delegating the bit-twiddling to the
    /// `leb128` crate and translating its position-less errors into ones
    /// that carry the offset the malformed value started at.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut slice = &self.data[self.pos..];
        let before = slice.len();
        let value = leb128::read::unsigned(&mut slice).map_err(|_| FaeError::MalformedLeb {
            offset: self.base + start,
        })?;
        self.pos += before - slice.len();
        Ok(value)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.pos;
        let mut slice = &self.data[self.pos..];
        let before = slice.len();
        let value = leb128::read::signed(&mut slice).map_err(|_| FaeError::MalformedLeb {
            offset: self.base + start,
        })?;
        self.pos += before - slice.len();
        Ok(value)
    }

    /// Reads a NUL-terminated string (used for CIE augmentation strings).
    pub fn read_cstr(&mut self) -> Result<&'a str> {
        let start = self.pos;
        loop {
            if self.pos >= self.data.len() {
                return Err(FaeError::OutOfRange {
                    offset: self.offset(),
                    requested: 1,
                    available: 0,
                });
            }
            if self.data[self.pos] == 0 {
                break;
            }
            self.pos += 1;
        }
        let slice = &self.data[start..self.pos];
        self.pos += 1; // consume the NUL
        std::str::from_utf8(slice).map_err(|_| FaeError::InvalidAugmentation {
            offset: self.base + start,
            augmentation: String::from_utf8_lossy(slice).into_owned(),
        })
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Returns a reader scoped to the next `len` bytes without advancing
    /// past them in `self`; used to bound CIE/FDE instruction streams to
    /// their declared length.
    pub fn subreader(&self, len: usize) -> Result<Reader<'a>> {
        if self.pos + len > self.data.len() {
            return Err(FaeError::OutOfRange {
                offset: self.offset(),
                requested: len,
                available: self.data.len() - self.pos,
            });
        }
        Ok(Reader::with_base(
            &self.data[self.pos..self.pos + len],
            self.offset(),
        ))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }

    pub fn seek_to(&mut self, absolute_offset: usize) -> Result<()> {
        let target = absolute_offset.checked_sub(self.base).ok_or(FaeError::OutOfRange {
            offset: absolute_offset,
            requested: 0,
            available: self.data.len(),
        })?;
        if target > self.data.len() {
            return Err(FaeError::OutOfRange {
                offset: absolute_offset,
                requested: 0,
                available: self.data.len(),
            });
        }
        self.pos = target;
        Ok(())
    }
}
