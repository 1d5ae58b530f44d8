use std::io::{Read, Write};

use crate::error::SnapshotError;

type Result<T> = std::result::Result<T, SnapshotError>;

pub(crate) trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_len_u32(&mut self, len: usize) -> Result<()> {
        let len: u32 = len
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("length does not fit in u32"))?;
        self.write_u32_le(len)
    }

    /// Length-prefixed list of page numbers.
    fn write_pages(&mut self, pages: &[u32]) -> Result<()> {
        self.write_len_u32(pages.len())?;
        for &page in pages {
            self.write_u32_le(page)?;
        }
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub(crate) trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Length prefix, rejected if above `max`.
    fn read_len_u32(&mut self, max: usize, what: &'static str) -> Result<usize> {
        let len = self.read_u32_le()? as usize;
        if len > max {
            return Err(SnapshotError::Corrupt(what));
        }
        Ok(len)
    }

    /// Length-prefixed list of page numbers, each below `limit`.
    fn read_pages(&mut self, max: usize, limit: u32, what: &'static str) -> Result<Vec<u32>> {
        let len = self.read_len_u32(max, what)?;
        let mut pages = Vec::with_capacity(len);
        for _ in 0..len {
            let page = self.read_u32_le()?;
            if page >= limit {
                return Err(SnapshotError::Corrupt(what));
            }
            pages.push(page);
        }
        Ok(pages)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}
