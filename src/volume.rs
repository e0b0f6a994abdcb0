//! In-RAM volume model and conversion to/from the on-flash volume header.

use std::collections::BTreeMap;

use crate::error::{Result, UbiError};
use crate::headers::{VolHdr, UBI_VOLUME_NAME_MAX_LEN};

/// UBI volume types.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// May be rewritten LEB-by-LEB in any order.
    #[default]
    Dynamic,

    /// Written once at provisioning time; resizing is not allowed.
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// Creation-time parameters of a volume.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeConfig {
    /// Volume name, at most [`UBI_VOLUME_NAME_MAX_LEN`] bytes. Any UTF-8
    /// string works, but other UBI implementors might assume ASCII, so
    /// it's best to stick to that.
    pub name: String,

    /// The type of volume.
    pub vol_type: VolType,

    /// Number of LEBs reserved for the volume.
    pub leb_count: u32,
}

impl VolumeConfig {
    /// Caller-input validation for create/resize arguments.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self.name.len() > UBI_VOLUME_NAME_MAX_LEN
            || self.leb_count == 0
        {
            return Err(UbiError::InvalidArgument);
        }
        Ok(())
    }

    /// Render this config as the on-flash volume header for `vol_id`.
    pub(crate) fn to_hdr(&self, vol_id: u32) -> Result<VolHdr> {
        self.validate()?;
        let name_bytes = self.name.as_bytes();
        let mut name = [0u8; UBI_VOLUME_NAME_MAX_LEN];
        name[..name_bytes.len()].copy_from_slice(name_bytes);
        Ok(VolHdr::new(vol_id, self.vol_type.into(), self.leb_count, name))
    }

    /// Reconstruct `(vol_id, config)` from a CRC-validated volume header.
    pub(crate) fn from_hdr(hdr: &VolHdr) -> Result<(u32, Self)> {
        let vol_type = VolType::try_from(hdr.vol_type).map_err(|_| UbiError::BadHeader)?;

        let name_len = hdr
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(UBI_VOLUME_NAME_MAX_LEN);
        let name = std::str::from_utf8(&hdr.name[..name_len])
            .map_err(|_| UbiError::BadHeader)?
            .to_string();
        if name.is_empty() || hdr.leb_count == 0 {
            return Err(UbiError::BadHeader);
        }

        Ok((
            hdr.vol_id,
            Self {
                name,
                vol_type,
                leb_count: hdr.leb_count,
            },
        ))
    }
}

/// A live volume: its position in the persisted header table, its config,
/// and the LEB → PEB association table.
#[derive(Debug, Clone)]
pub(crate) struct UbiVolume {
    /// Dense position in the persisted header table.
    pub vol_idx: u32,

    pub cfg: VolumeConfig,

    /// The erase block association table: lnum → pnum.
    pub eba: BTreeMap<u32, u32>,
}
