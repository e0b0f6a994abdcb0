//! An Unsorted Block Images (UBI) layer for raw NOR/NAND flash partitions.
//!
//! UBI sits between an MTD-style flash partition and higher-level consumers
//! (filesystems, settings stores) and exposes named volumes of logical erase
//! blocks (LEBs) on top of the partition's physical erase blocks (PEBs). It
//! provides three guarantees:
//!
//! - wear-leveling: a write always allocates the free PEB with the lowest
//!   erase counter, so erase cycles spread uniformly across the partition;
//! - power-fail-safe metadata: the device header and volume table are kept
//!   as two replicated banks of CRC'd records in the first two PEBs, and a
//!   torn commit is repaired on the next mount;
//! - log-structured LEB updates: an overwrite lands on a fresh PEB before
//!   the superseded PEB is retired, so at least one valid copy of every LEB
//!   survives an interruption at any point.
//!
//! The entry point is [`UbiDevice::open`] over anything implementing
//! [`mtd::Mtd`]. [`mtd::RamMtd`] simulates a partition in memory; on Linux,
//! `mtd::linux::MtdDev` drives a real `/dev/mtdX` partition.

pub mod mtd;

mod device;
mod error;
mod geom;
mod headers;
mod meta;
mod pools;
mod scan;
mod volume;

pub use device::{DeviceInfo, UbiDevice, VolumeInfo};
pub use error::{Result, UbiError};
pub use headers::{UBI_VOLUME_NAME_MAX_LEN, WRITE_BLOCK_SIZE_ALIGNMENT};
pub use volume::{VolType, VolumeConfig};

/// Upper bound on simultaneously existing volumes. The volume header table
/// must additionally fit in a single metadata bank PEB, which caps it
/// further on very small erase blocks.
pub const MAX_VOLUMES: usize = 16;
