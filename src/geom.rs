//! Partition geometry: how the UBI layer carves PEBs out of the MTD.

use crate::error::{Result, UbiError};
use crate::headers::{UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE, WRITE_BLOCK_SIZE_ALIGNMENT};
use crate::mtd::MtdInfo;

/// The two PEBs reserved for the metadata banks.
pub(crate) const BANK_PEBS: [u32; 2] = [0, 1];

/// Byte offset of the VID header within a data PEB.
pub(crate) const VID_HDR_OFFSET: u64 = UBI_EC_HDR_SIZE as u64;

/// Byte offset of the LEB payload within a data PEB.
pub(crate) const DATA_OFFSET: u64 = (UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE) as u64;

/// Validated partition parameters in PEB terms.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Geometry {
    pub peb_count: u32,
    pub peb_size: u32,
    pub write_size: usize,
}

impl Geometry {
    /// Check the MTD-reported parameters and derive the PEB layout.
    ///
    /// The write block must divide the record padding granule, the erase
    /// block must be a power of two with room for the headers, and the
    /// partition must hold the two metadata banks plus at least one data
    /// PEB.
    pub fn new(info: &MtdInfo) -> Result<Self> {
        let eb = info.erase_block_size;
        let w = info.write_block_size;

        if !eb.is_power_of_two() || u64::from(eb) <= DATA_OFFSET + WRITE_BLOCK_SIZE_ALIGNMENT as u64 {
            return Err(UbiError::InvalidArgument);
        }
        if w == 0 || WRITE_BLOCK_SIZE_ALIGNMENT % w != 0 {
            return Err(UbiError::InvalidArgument);
        }
        if info.partition_size == 0
            || info.partition_size % u64::from(eb) != 0
            || info.partition_size > u64::from(u32::MAX)
        {
            return Err(UbiError::InvalidArgument);
        }

        let peb_count = (info.partition_size / u64::from(eb)) as u32;
        if peb_count <= BANK_PEBS.len() as u32 {
            return Err(UbiError::InvalidArgument);
        }

        Ok(Self {
            peb_count,
            peb_size: eb,
            write_size: w,
        })
    }

    /// Byte offset of PEB `pnum` within the partition.
    pub fn peb_offset(&self, pnum: u32) -> u64 {
        u64::from(pnum) * u64::from(self.peb_size)
    }

    /// PEB numbers of the data region (everything past the metadata banks).
    pub fn data_pebs(&self) -> std::ops::Range<u32> {
        BANK_PEBS.len() as u32..self.peb_count
    }

    /// Number of LEBs the data region can hold.
    pub fn leb_total(&self) -> u32 {
        self.peb_count - BANK_PEBS.len() as u32
    }

    /// Usable payload bytes per LEB.
    pub fn leb_size(&self) -> usize {
        self.peb_size as usize - DATA_OFFSET as usize
    }

    /// Partition size in bytes, as persisted in the device header.
    pub fn partition_bytes(&self) -> u32 {
        self.peb_count * self.peb_size
    }
}
