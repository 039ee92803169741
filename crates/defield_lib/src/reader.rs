use byteorder::{ByteOrder, LittleEndian};

use crate::error::DecompileError;

/// Bounds-checked little-endian cursor over a script buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), DecompileError> {
        if pos > self.buf.len() {
            return Err(DecompileError::TruncatedData {
                pos: self.buf.len(),
                wanted: pos - self.buf.len(),
                remaining: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecompileError> {
        if self.remaining() < n {
            return Err(DecompileError::TruncatedData {
                pos: self.pos,
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecompileError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_s8(&mut self) -> Result<i8, DecompileError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecompileError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_s16(&mut self) -> Result<i16, DecompileError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecompileError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_s32(&mut self) -> Result<i32, DecompileError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }
}
