//! The dual-bank metadata store.
//!
//! The device header and the volume header table live twice on flash, in
//! PEB 0 (bank 0) and PEB 1 (bank 1). A commit erases and rewrites bank 0
//! first, then bank 1; whatever state a power cut leaves behind, at least
//! one bank still carries a complete table, and the next mount replicates
//! it back over its peer.

use log::{info, warn};

use crate::error::{Result, UbiError};
use crate::geom::{Geometry, BANK_PEBS};
use crate::headers::{
    ComputeCrc, DevHdr, ParseHeader, VolHdr, UBI_DEV_HDR_SIZE, UBI_VOL_HDR_SIZE,
};
use crate::mtd::Mtd;
use crate::volume::VolumeConfig;
use crate::MAX_VOLUMES;

/// Joint validity of the two metadata banks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BankState {
    /// Both banks parse and agree on `(revision, hdr_crc)`; reads use
    /// bank 0.
    BanksValid,

    /// Both banks parse but disagree; the newer revision is authoritative.
    BankDiverged,

    /// Only bank 0 parses.
    Bank0Only,

    /// Only bank 1 parses.
    Bank1Only,

    /// Neither bank parses; the partition is unformatted (or beyond
    /// recovery).
    NoneValid,
}

/// The in-RAM image of the persisted metadata: the revision counter plus
/// the dense `(vol_id, config)` table in vol_idx order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct MetaTable {
    pub revision: u64,
    pub volumes: Vec<(u32, VolumeConfig)>,
}

/// Result of probing and recovering the metadata store at mount time.
#[derive(Debug)]
pub(crate) enum MountTable {
    /// A table was found; the stale or lost peer bank has been rewritten.
    Found(MetaTable),

    /// Neither bank is valid; the partition must be freshly formatted.
    Unformatted,
}

fn read_dev_hdr<M: Mtd>(mtd: &M, geo: &Geometry, bank: usize) -> Result<Option<DevHdr>> {
    let mut buf = [0u8; UBI_DEV_HDR_SIZE];
    mtd.read(geo.peb_offset(BANK_PEBS[bank]), &mut buf)?;
    Ok(DevHdr::parse(&buf))
}

/// Probe both banks and classify their joint state.
pub(crate) fn bank_state<M: Mtd>(
    mtd: &M,
    geo: &Geometry,
) -> Result<(BankState, Option<DevHdr>, Option<DevHdr>)> {
    let h0 = read_dev_hdr(mtd, geo, 0)?;
    let h1 = read_dev_hdr(mtd, geo, 1)?;

    let state = match (&h0, &h1) {
        (Some(a), Some(b)) if (a.revision, a.hdr_crc) == (b.revision, b.hdr_crc) => {
            BankState::BanksValid
        }
        (Some(_), Some(_)) => BankState::BankDiverged,
        (Some(_), None) => BankState::Bank0Only,
        (None, Some(_)) => BankState::Bank1Only,
        (None, None) => BankState::NoneValid,
    };

    Ok((state, h0, h1))
}

/// Load the full table from one bank whose device header already parsed.
pub(crate) fn load_table<M: Mtd>(
    mtd: &M,
    geo: &Geometry,
    bank: usize,
    hdr: &DevHdr,
) -> Result<MetaTable> {
    if hdr.partition_size != geo.partition_bytes() || hdr.vol_count as usize > MAX_VOLUMES {
        return Err(UbiError::BadHeader);
    }

    let base = geo.peb_offset(BANK_PEBS[bank]) + UBI_DEV_HDR_SIZE as u64;
    let mut volumes = Vec::with_capacity(hdr.vol_count as usize);
    let mut buf = [0u8; UBI_VOL_HDR_SIZE];
    for idx in 0..hdr.vol_count {
        mtd.read(base + u64::from(idx) * UBI_VOL_HDR_SIZE as u64, &mut buf)?;
        let vol_hdr = VolHdr::parse(&buf).ok_or(UbiError::BadHeader)?;
        volumes.push(VolumeConfig::from_hdr(&vol_hdr)?);
    }

    Ok(MetaTable {
        revision: hdr.revision,
        volumes,
    })
}

/// Render the table into the exact byte image of one bank.
pub(crate) fn table_bytes(geo: &Geometry, table: &MetaTable) -> Result<Vec<u8>> {
    if table.volumes.len() > MAX_VOLUMES {
        return Err(UbiError::NoSpace);
    }

    let dev = DevHdr::new(geo.partition_bytes(), table.revision, table.volumes.len() as u32);
    let mut buf = dev.bytes();
    for (vol_id, cfg) in &table.volumes {
        buf.extend_from_slice(&cfg.to_hdr(*vol_id)?.bytes());
    }

    if buf.len() > geo.peb_size as usize {
        return Err(UbiError::NoSpace);
    }
    Ok(buf)
}

/// Two-phase commit of a bank image: bank 0 is erased and rewritten first,
/// then bank 1. A crash in between leaves bank 0 carrying the newer table,
/// which the next mount adopts and replicates.
pub(crate) fn overwrite_both_banks<M: Mtd>(mtd: &mut M, geo: &Geometry, buf: &[u8]) -> Result<()> {
    for bank in BANK_PEBS {
        let offset = geo.peb_offset(bank);
        mtd.erase(offset, u64::from(geo.peb_size))?;
        mtd.write(offset, buf)?;
    }
    Ok(())
}

/// Probe the banks and bring them back to the replicated state.
///
/// A sole valid bank is adopted and copied over its peer; diverged banks
/// resolve to the newer revision. With no valid bank the caller formats
/// from scratch.
pub(crate) fn probe_and_recover<M: Mtd>(mtd: &mut M, geo: &Geometry) -> Result<MountTable> {
    let (state, h0, h1) = bank_state(mtd, geo)?;

    let (bank, hdr) = match (state, h0, h1) {
        (BankState::BanksValid, Some(hdr), _) => {
            return Ok(MountTable::Found(load_table(mtd, geo, 0, &hdr)?));
        }
        (BankState::BankDiverged, Some(a), Some(b)) => {
            if a.revision >= b.revision {
                (0, a)
            } else {
                (1, b)
            }
        }
        (BankState::Bank0Only, Some(hdr), _) => (0, hdr),
        (BankState::Bank1Only, _, Some(hdr)) => (1, hdr),
        _ => return Ok(MountTable::Unformatted),
    };

    warn!("metadata banks in state {state:?}; adopting bank {bank}");
    let table = load_table(mtd, geo, bank, &hdr)?;
    let buf = table_bytes(geo, &table)?;
    overwrite_both_banks(mtd, geo, &buf)?;
    info!(
        "metadata replicated from bank {bank} at revision {}",
        table.revision
    );

    Ok(MountTable::Found(table))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtd::{MtdInfo, RamMtd};
    use crate::volume::VolType;

    const TEST_INFO: MtdInfo = MtdInfo {
        partition_size: 16 * 8192,
        erase_block_size: 8192,
        write_block_size: 16,
    };

    fn geo() -> Geometry {
        Geometry::new(&TEST_INFO).unwrap()
    }

    fn sample_table(revision: u64) -> MetaTable {
        let cfg = |name: &str, leb_count| VolumeConfig {
            name: name.to_string(),
            vol_type: VolType::Dynamic,
            leb_count,
        };
        MetaTable {
            revision,
            volumes: vec![(0, cfg("boot", 4)), (2, cfg("settings", 3))],
        }
    }

    fn commit(mtd: &mut RamMtd, table: &MetaTable) -> Result<()> {
        let buf = table_bytes(&geo(), table)?;
        overwrite_both_banks(mtd, &geo(), &buf)
    }

    #[test]
    fn commit_then_load_round_trip() -> anyhow::Result<()> {
        let mut mtd = RamMtd::new(TEST_INFO);
        let table = sample_table(7);
        commit(&mut mtd, &table)?;

        let (state, h0, _) = bank_state(&mtd, &geo())?;
        assert_eq!(state, BankState::BanksValid);
        let loaded = load_table(&mtd, &geo(), 0, &h0.unwrap())?;
        assert_eq!(loaded, table);
        Ok(())
    }

    #[test]
    fn blank_partition_probes_invalid() -> anyhow::Result<()> {
        let mtd = RamMtd::new(TEST_INFO);
        let (state, h0, h1) = bank_state(&mtd, &geo())?;
        assert_eq!(state, BankState::NoneValid);
        assert!(h0.is_none() && h1.is_none());
        assert!(matches!(
            probe_and_recover(&mut RamMtd::new(TEST_INFO), &geo())?,
            MountTable::Unformatted
        ));
        Ok(())
    }

    #[test]
    fn lost_bank_is_recovered() -> anyhow::Result<()> {
        let mut mtd = RamMtd::new(TEST_INFO);
        let table = sample_table(3);
        commit(&mut mtd, &table)?;

        // A power cut after step 1 of the next commit: bank 0 erased.
        mtd.erase(0, 8192)?;
        let (state, _, _) = bank_state(&mtd, &geo())?;
        assert_eq!(state, BankState::Bank1Only);

        match probe_and_recover(&mut mtd, &geo())? {
            MountTable::Found(recovered) => assert_eq!(recovered, table),
            other => panic!("expected recovery, got {other:?}"),
        }
        let (state, _, _) = bank_state(&mtd, &geo())?;
        assert_eq!(state, BankState::BanksValid);
        Ok(())
    }

    #[test]
    fn diverged_banks_resolve_to_newer_revision() -> anyhow::Result<()> {
        let mut mtd = RamMtd::new(TEST_INFO);
        let g = geo();

        let old = sample_table(3);
        let new = sample_table(4);
        commit(&mut mtd, &new)?;

        // Rewind bank 0 to the older revision by hand: both banks now
        // parse but disagree.
        let old_buf = table_bytes(&g, &old)?;
        mtd.erase(0, 8192)?;
        mtd.write(0, &old_buf)?;

        let (state, _, _) = bank_state(&mtd, &g)?;
        assert_eq!(state, BankState::BankDiverged);

        match probe_and_recover(&mut mtd, &g)? {
            MountTable::Found(recovered) => assert_eq!(recovered, new),
            other => panic!("expected recovery, got {other:?}"),
        }
        let (state, h0, _) = bank_state(&mtd, &g)?;
        assert_eq!(state, BankState::BanksValid);
        assert_eq!(h0.unwrap().revision, 4);
        Ok(())
    }

    #[test]
    fn oversized_table_is_rejected() {
        let cfg = VolumeConfig {
            name: "v".to_string(),
            vol_type: VolType::Dynamic,
            leb_count: 1,
        };
        let table = MetaTable {
            revision: 0,
            volumes: (0..MAX_VOLUMES as u32 + 1).map(|id| (id, cfg.clone())).collect(),
        };
        assert!(matches!(
            table_bytes(&geo(), &table),
            Err(UbiError::NoSpace)
        ));
    }
}
