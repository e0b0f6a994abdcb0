//! On-flash record definitions: the device, volume, EC, and VID headers,
//! with CRC verification/computation.
//!
//! All records are little-endian with a trailing CRC32 computed over every
//! byte before the crc field, and every record size is a multiple of
//! [`WRITE_BLOCK_SIZE_ALIGNMENT`] so the codec never has to restage a
//! header for the device's write granularity.

use crc::{Crc, CRC_32_ISO_HDLC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::prelude::*;

/// CRC32/IEEE (reflected, init and final xor `0xFFFFFFFF`), shared by all
/// record types.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The only record format version in existence.
pub const UBI_VERSION: u8 = 1;

/// Record sizes are multiples of this, so any write block size dividing it
/// can program a record directly.
pub const WRITE_BLOCK_SIZE_ALIGNMENT: usize = 16;

/// Number of bytes a volume name may occupy on flash, NUL padding included.
pub const UBI_VOLUME_NAME_MAX_LEN: usize = 16;

pub const UBI_DEV_HDR_MAGIC: u32 = 0x5542_4925; // "UBI%"
pub const UBI_VOL_HDR_MAGIC: u32 = 0x5542_4926; // "UBI&"
pub const UBI_EC_HDR_MAGIC: u32 = 0x5542_4923; // "UBI#"
pub const UBI_VID_HDR_MAGIC: u32 = 0x5542_4921; // "UBI!"

pub const UBI_DEV_HDR_SIZE: usize = 32;
pub const UBI_VOL_HDR_SIZE: usize = 48;
pub const UBI_EC_HDR_SIZE: usize = 16;
pub const UBI_VID_HDR_SIZE: usize = 32;

/// Per-partition record, first in each metadata bank PEB.
#[derive(Debug, Default, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DevHdr {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],
    pub partition_offset: u32,
    pub partition_size: u32,
    pub revision: u64,
    pub vol_count: u32,
    pub hdr_crc: u32,
}

/// One entry of the volume header table, directly after the device header.
#[derive(Debug, Default, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VolHdr {
    pub magic: u32,
    pub version: u8,
    pub vol_type: u8,
    pub padding: [u8; 2],
    pub vol_id: u32,
    pub leb_count: u32,
    pub name: [u8; UBI_VOLUME_NAME_MAX_LEN],
    pub reserved: [u8; 12],
    pub hdr_crc: u32,
}

/// Erase-counter header at offset 0 of every data PEB; rewritten on each
/// erase with the counter incremented.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EcHdr {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],
    pub ec: u32,
    pub hdr_crc: u32,
}

/// Volume-ID header, written once per LEB write directly after the EC
/// header. `sqnum` disambiguates duplicate LEB claims found at mount.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VidHdr {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub sqnum: u64,
    pub hdr_crc: u32,
}

/// Computes the CRC field of a record: CRC32 over every byte preceding the
/// trailing crc field.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        let len = bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&bytes[..len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    /// Serialize the record. Layouts are fixed, so this cannot fail.
    fn bytes(&self) -> Vec<u8> {
        self.to_bytes().unwrap()
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for DevHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VolHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// Parsing with magic, version, and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn magic() -> u32;
    fn hdr_magic(&self) -> u32;
    fn hdr_version(&self) -> u8;

    /// Decode a record from `buf`, rejecting short input, a wrong magic or
    /// version, and CRC mismatches.
    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if (header.hdr_magic(), header.hdr_version()) != (Self::magic(), UBI_VERSION) {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

impl ParseHeader<'_> for DevHdr {
    fn magic() -> u32 {
        UBI_DEV_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VolHdr {
    fn magic() -> u32 {
        UBI_VOL_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for EcHdr {
    fn magic() -> u32 {
        UBI_EC_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn magic() -> u32 {
        UBI_VID_HDR_MAGIC
    }
    fn hdr_magic(&self) -> u32 {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

impl DevHdr {
    /// Build a CRC-stamped device header.
    pub fn new(partition_size: u32, revision: u64, vol_count: u32) -> Self {
        let mut hdr = Self {
            magic: UBI_DEV_HDR_MAGIC,
            version: UBI_VERSION,
            partition_offset: 0,
            partition_size,
            revision,
            vol_count,
            ..Default::default()
        };
        hdr.fix_crc();
        hdr
    }
}

impl VolHdr {
    /// Build a CRC-stamped volume header.
    pub fn new(vol_id: u32, vol_type: u8, leb_count: u32, name: [u8; UBI_VOLUME_NAME_MAX_LEN]) -> Self {
        let mut hdr = Self {
            magic: UBI_VOL_HDR_MAGIC,
            version: UBI_VERSION,
            vol_type,
            vol_id,
            leb_count,
            name,
            ..Default::default()
        };
        hdr.fix_crc();
        hdr
    }
}

impl EcHdr {
    /// Build a CRC-stamped EC header.
    pub fn new(ec: u32) -> Self {
        let mut hdr = Self {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,
            ec,
            ..Default::default()
        };
        hdr.fix_crc();
        hdr
    }
}

impl VidHdr {
    /// Build a CRC-stamped VID header.
    pub fn new(vol_id: u32, lnum: u32, data_size: u32, sqnum: u64) -> Self {
        let mut hdr = Self {
            magic: UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,
            vol_id,
            lnum,
            data_size,
            sqnum,
            ..Default::default()
        };
        hdr.fix_crc();
        hdr
    }
}
