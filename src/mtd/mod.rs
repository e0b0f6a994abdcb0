//! Abstractions and code to access the flash partition backing a UBI
//! device.

use std::io::{self, Read, Write};

#[cfg(target_os = "linux")]
pub mod linux;

/// Convenience methods for `[u8]` regions read back from flash.
pub trait SliceUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl SliceUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing a flash partition as reported by the MTD.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MtdInfo {
    /// Total partition size in bytes.
    pub partition_size: u64,

    /// Size of one physical erase block.
    pub erase_block_size: u32,

    /// Write granularity: programs must be this aligned and sized.
    pub write_block_size: usize,
}

/// Represents the flash partition a UBI device lives on.
///
/// All offsets are relative to the partition start. Implementations report
/// failures as [`io::Error`]; the UBI layer wraps them into its `EIO`
/// class.
pub trait Mtd {
    /// Get the partition parameters.
    fn info(&self) -> MtdInfo;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Program `buf` at `offset`. Both `offset` and `buf.len()` must be
    /// multiples of the write block size.
    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Erase `len` bytes at `offset`; both must be whole erase blocks.
    fn erase(&mut self, offset: u64, len: u64) -> io::Result<()>;
}

/// Write `data` at `offset`, staging the tail up to the device write block.
///
/// Flash accepts only write-block-sized, -aligned programs while LEB
/// payloads have arbitrary lengths: the aligned head is written as-is and a
/// short tail goes through a zero-padded staging block.
pub(crate) fn write_padded<M: Mtd>(mtd: &mut M, offset: u64, data: &[u8]) -> io::Result<()> {
    let w = mtd.info().write_block_size;
    let tail_len = data.len() % w;

    if tail_len == 0 {
        if !data.is_empty() {
            mtd.write(offset, data)?;
        }
        return Ok(());
    }

    let head_len = data.len() - tail_len;
    if head_len > 0 {
        mtd.write(offset, &data[..head_len])?;
    }

    let mut tail = vec![0u8; w];
    tail[..tail_len].copy_from_slice(&data[head_len..]);
    mtd.write(offset + head_len as u64, &tail)
}

/// A simulated in-memory flash partition, for testing purposes and image
/// work.
///
/// The simulator enforces flash legality: programs must be write-block
/// aligned and may only target erased (all-`0xFF`) bytes, and erases cover
/// whole erase blocks. It can also be armed to fail an upcoming write or
/// erase, which is how power-cut and bad-block paths are exercised.
#[derive(Debug, Clone)]
pub struct RamMtd {
    data: Vec<u8>,
    info: MtdInfo,
    fail_writes_after: Option<u32>,
    fail_erases_after: Option<u32>,
}

impl RamMtd {
    /// Create a fully erased partition with the specified parameters.
    pub fn new(info: MtdInfo) -> Self {
        Self {
            data: vec![0xFF; info.partition_size as usize],
            info,
            fail_writes_after: None,
            fail_erases_after: None,
        }
    }

    /// Arm the simulator: the next `n` writes succeed, the one after fails.
    /// The failure fires once, then disarms.
    pub fn fail_writes_after(&mut self, n: u32) {
        self.fail_writes_after = Some(n);
    }

    /// Arm the simulator: the next `n` erases succeed, the one after fails.
    /// The failure fires once, then disarms.
    pub fn fail_erases_after(&mut self, n: u32) {
        self.fail_erases_after = Some(n);
    }

    /// Initialize the partition contents from a readable stream.
    pub fn load<R: Read>(&mut self, read: &mut R) -> io::Result<()> {
        read.read_exact(&mut self.data)
    }

    /// Dump the partition contents to a writable stream (such as a File).
    pub fn save<W: Write>(&self, write: &mut W) -> io::Result<()> {
        write.write_all(&self.data)
    }

    fn trip(slot: &mut Option<u32>) -> bool {
        match slot {
            Some(0) => {
                *slot = None;
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let begin = offset as usize;
        let end = begin
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "access out of bounds"))?;
        Ok(begin..end)
    }
}

impl Mtd for RamMtd {
    fn info(&self) -> MtdInfo {
        self.info
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let w = self.info.write_block_size;
        if offset % w as u64 != 0 || buf.len() % w != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "program not write-block aligned",
            ));
        }
        if Self::trip(&mut self.fail_writes_after) {
            return Err(io::Error::other("injected write failure"));
        }
        let range = self.range(offset, buf.len())?;
        if !self.data[range.clone()].is_erased() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "program into non-erased area",
            ));
        }
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let eb = u64::from(self.info.erase_block_size);
        if len == 0 || offset % eb != 0 || len % eb != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "erase not whole erase blocks",
            ));
        }
        if Self::trip(&mut self.fail_erases_after) {
            return Err(io::Error::other("injected erase failure"));
        }
        let range = self.range(offset, len as usize)?;
        self.data[range].fill(0xFF);
        Ok(())
    }
}
