//! Storage back-end interface consumed by blk and scsi: `pread`/`pwrite`/
//! `close` against a raw file or a copy-on-write layered file. Format
//! *probing* (deciding which of these a given file is) stays an
//! external collaborator; these types are constructed already knowing
//! their kind.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Storage back-end contract. `read_at`/`write_at` return an error on
/// any short transfer; partial transfers are errors at this layer.
pub trait StorageBackend: Send {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()>;
    fn capacity_sectors(&self) -> u64;
    fn close(self: Box<Self>, force: bool) -> io::Result<()>;
}

fn short_transfer(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("short {what}"))
}

/// A flat file, read/written directly at `sector * 512` offsets.
pub struct RawFileBackend {
    file: File,
    capacity_sectors: u64,
}

impl RawFileBackend {
    pub fn open(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(RawFileBackend {
            file,
            capacity_sectors: len / crate::devices::blk::SECTOR_SIZE as u64,
        })
    }
}

impl StorageBackend for RawFileBackend {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.file.read_at(buf, off)?;
        if n != buf.len() {
            return Err(short_transfer("read"));
        }
        Ok(())
    }

    fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
        let n = self.file.write_at(buf, off)?;
        if n != buf.len() {
            return Err(short_transfer("write"));
        }
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn close(self: Box<Self>, force: bool) -> io::Result<()> {
        if !force {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// A base file plus a sparse overlay: writes land in the overlay, reads
/// fall through to the base for any byte range the overlay has never
/// had written to it. The overlay tracks written ranges at sector
/// granularity via a bitmap, mirroring the block-unit semantics of the
/// layered COW format named in the external interfaces section.
pub struct CowLayeredBackend {
    base: File,
    overlay: File,
    written: Vec<bool>,
    capacity_sectors: u64,
}

const SECTOR: u64 = 512;

impl CowLayeredBackend {
    pub fn open(base: File, overlay: File) -> io::Result<Self> {
        let len = base.metadata()?.len();
        let capacity_sectors = len / SECTOR;
        Ok(CowLayeredBackend {
            base,
            overlay,
            written: vec![false; capacity_sectors as usize],
            capacity_sectors,
        })
    }

    fn sector_range(off: u64, len: usize) -> std::ops::Range<u64> {
        let start = off / SECTOR;
        let end = (off + len as u64).div_ceil(SECTOR);
        start..end
    }
}

impl StorageBackend for CowLayeredBackend {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
        let sectors = Self::sector_range(off, buf.len());
        let all_overlaid = sectors
            .clone()
            .all(|s| self.written.get(s as usize).copied().unwrap_or(false));
        let source: &mut File = if all_overlaid { &mut self.overlay } else { &mut self.base };
        let n = source.read_at(buf, off)?;
        if n != buf.len() {
            return Err(short_transfer("read"));
        }
        Ok(())
    }

    fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
        let n = self.overlay.write_at(buf, off)?;
        if n != buf.len() {
            return Err(short_transfer("write"));
        }
        for s in Self::sector_range(off, buf.len()) {
            if let Some(slot) = self.written.get_mut(s as usize) {
                *slot = true;
            }
        }
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn close(self: Box<Self>, force: bool) -> io::Result<()> {
        if !force {
            self.overlay.sync_all()?;
        }
        Ok(())
    }
}

/// An in-memory back-end for tests: no real file descriptor involved.
pub struct MemBackend {
    pub data: Vec<u8>,
    pub fail_after: Option<usize>,
    calls: usize,
}

impl MemBackend {
    pub fn new(data: Vec<u8>) -> Self {
        MemBackend { data, fail_after: None, calls: 0 }
    }
}

impl StorageBackend for MemBackend {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
        self.calls += 1;
        if self.fail_after == Some(self.calls) {
            return Err(io::Error::other("injected failure"));
        }
        let off = off as usize;
        if off + buf.len() > self.data.len() {
            return Err(short_transfer("read"));
        }
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
        self.calls += 1;
        if self.fail_after == Some(self.calls) {
            return Err(io::Error::other("injected failure"));
        }
        let off = off as usize;
        if off + buf.len() > self.data.len() {
            self.data.resize(off + buf.len(), 0);
        }
        self.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.data.len() as u64 / SECTOR
    }

    fn close(self: Box<Self>, _force: bool) -> io::Result<()> {
        Ok(())
    }
}
