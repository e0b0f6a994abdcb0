//! The UBI device: mount and fresh-format, the LEB write engine, volume
//! lifecycle, and the per-call PEB reclaimer.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};

use crate::error::{Result, UbiError};
use crate::geom::{Geometry, DATA_OFFSET, VID_HDR_OFFSET};
use crate::headers::{
    ComputeCrc, EcHdr, ParseHeader, VidHdr, UBI_DEV_HDR_SIZE, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE,
    UBI_VOL_HDR_SIZE,
};
use crate::meta::{self, MetaTable, MountTable};
use crate::mtd::{self, Mtd};
use crate::pools::PebPool;
use crate::scan;
use crate::volume::{UbiVolume, VolType, VolumeConfig};

/// Aggregated device counters, as returned by [`UbiDevice::info`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    /// LEBs the data region can hold in total.
    pub leb_total: u32,

    /// Usable payload bytes per LEB.
    pub leb_size: usize,

    /// PEBs ready for allocation.
    pub free_pebs: usize,

    /// Superseded PEBs awaiting reclaim.
    pub dirty_pebs: usize,

    /// Quarantined PEBs.
    pub bad_pebs: usize,

    /// LEBs reserved by volumes (sum of their configured sizes).
    pub allocated_lebs: u32,

    /// Number of volumes.
    pub volumes: usize,
}

/// Per-volume counters, as returned by [`UbiDevice::volume_info`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeInfo {
    pub config: VolumeConfig,

    /// Number of LEBs currently mapped to a PEB.
    pub allocated_lebs: usize,
}

struct Inner<M> {
    mtd: M,
    geo: Geometry,
    /// Revision of the last committed metadata table.
    revision: u64,
    /// Strictly greater than every sequence number persisted so far.
    global_seqnr: u64,
    /// Next vol_id to issue.
    vols_seqnr: u32,
    /// Mean erase count observed at mount, the stand-in EC for PEBs
    /// quarantined without a readable EC header.
    ec_avg: u32,
    free: PebPool,
    dirty: PebPool,
    bad: BTreeMap<u32, u32>,
    volumes: BTreeMap<u32, UbiVolume>,
}

/// A mounted UBI device.
///
/// Every public operation serializes on one device-wide mutex, so a shared
/// reference can be used from multiple threads; operations block until the
/// MTD finishes.
pub struct UbiDevice<M> {
    inner: Mutex<Inner<M>>,
}

impl<M: Mtd> UbiDevice<M> {
    /// Mount the UBI partition on `mtd`.
    ///
    /// A torn metadata commit is repaired first; if no valid metadata bank
    /// exists at all, the partition is freshly formatted (every data PEB
    /// erased and stamped with an erase counter of zero).
    pub fn open(mut mtd: M) -> Result<Self> {
        let geo = Geometry::new(&mtd.info())?;

        let inner = match meta::probe_and_recover(&mut mtd, &geo)? {
            MountTable::Found(table) => Inner::mount(mtd, geo, table)?,
            MountTable::Unformatted => Inner::format(mtd, geo)?,
        };

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Unmount, handing the MTD back.
    pub fn close(self) -> M {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .mtd
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Aggregate counters for the device.
    pub fn info(&self) -> DeviceInfo {
        let inner = self.lock();
        DeviceInfo {
            leb_total: inner.geo.leb_total(),
            leb_size: inner.geo.leb_size(),
            free_pebs: inner.free.len(),
            dirty_pebs: inner.dirty.len(),
            bad_pebs: inner.bad.len(),
            allocated_lebs: inner.volumes.values().map(|v| v.cfg.leb_count).sum(),
            volumes: inner.volumes.len(),
        }
    }

    /// Reclaim at most one dirty PEB: erase it, bump its erase counter,
    /// and return it to the free pool. With no dirty PEBs this is a no-op.
    ///
    /// A PEB that fails any step is quarantined and the error reported;
    /// the device stays usable.
    pub fn erase_peb(&self) -> Result<()> {
        let inner = &mut *self.lock();
        let Some((pool_ec, pnum)) = inner.dirty.take_min() else {
            return Ok(());
        };

        let offset = inner.geo.peb_offset(pnum);

        // The pool key may be stale; the EC header on flash is
        // authoritative.
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        if let Err(err) = inner.mtd.read(offset, &mut buf) {
            warn!("PEB {pnum}: EC read failed during reclaim, quarantining");
            inner.bad.insert(pnum, pool_ec);
            return Err(err.into());
        }
        let Some(hdr) = EcHdr::parse(&buf) else {
            warn!("PEB {pnum}: EC header invalid during reclaim, quarantining");
            inner.bad.insert(pnum, pool_ec);
            return Err(UbiError::BadHeader);
        };

        if let Err(err) = inner.mtd.erase(offset, u64::from(inner.geo.peb_size)) {
            warn!("PEB {pnum}: erase failed, quarantining");
            inner.bad.insert(pnum, hdr.ec);
            return Err(err.into());
        }

        let ec = hdr.ec.saturating_add(1);
        if let Err(err) = inner.mtd.write(offset, &EcHdr::new(ec).bytes()) {
            warn!("PEB {pnum}: EC header write failed, quarantining");
            inner.bad.insert(pnum, ec);
            return Err(err.into());
        }

        inner.free.insert(ec, pnum);
        Ok(())
    }

    /// Read back the erase counter of every data-region PEB, in PEB order.
    ///
    /// Diagnostic surface, primarily for wear audits and tests.
    pub fn peb_erase_counters(&self) -> Result<Vec<u32>> {
        let inner = self.lock();
        let mut counters = Vec::with_capacity(inner.geo.leb_total() as usize);
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        for pnum in inner.geo.data_pebs() {
            // A quarantined PEB may be left without a readable EC header
            // (e.g. erased but never restamped); report its last-known
            // counter instead of failing the whole audit.
            if let Some(&ec) = inner.bad.get(&pnum) {
                counters.push(ec);
                continue;
            }
            inner.mtd.read(inner.geo.peb_offset(pnum), &mut buf)?;
            let hdr = EcHdr::parse(&buf).ok_or(UbiError::BadHeader)?;
            counters.push(hdr.ec);
        }
        Ok(counters)
    }

    /// Create a volume and return its vol_id.
    ///
    /// Creating a name that already exists returns the existing volume's
    /// id without touching anything.
    pub fn create_volume(&self, cfg: &VolumeConfig) -> Result<u32> {
        cfg.validate()?;
        let inner = &mut *self.lock();

        if let Some((&vol_id, _)) = inner.volumes.iter().find(|(_, v)| v.cfg.name == cfg.name) {
            return Ok(vol_id);
        }

        if inner.volumes.len() >= crate::MAX_VOLUMES {
            return Err(UbiError::NoSpace);
        }
        // The grown header table must still fit in one bank PEB; checked
        // here so a doomed commit cannot leave a phantom volume in RAM.
        let table_size = UBI_DEV_HDR_SIZE + (inner.volumes.len() + 1) * UBI_VOL_HDR_SIZE;
        if table_size > inner.geo.peb_size as usize {
            return Err(UbiError::NoSpace);
        }
        let allocated: u32 = inner.volumes.values().map(|v| v.cfg.leb_count).sum();
        if (inner.free.len() as u64) < u64::from(cfg.leb_count) + u64::from(allocated) {
            return Err(UbiError::NoSpace);
        }

        let vol_id = inner.vols_seqnr;
        let vol_idx = inner.volumes.len() as u32;
        inner.volumes.insert(
            vol_id,
            UbiVolume {
                vol_idx,
                cfg: cfg.clone(),
                eba: BTreeMap::new(),
            },
        );
        inner.vols_seqnr += 1;

        inner.commit()?;
        info!("volume {vol_id} ({:?}) created with {} LEBs", cfg.name, cfg.leb_count);
        Ok(vol_id)
    }

    /// Resize a dynamic volume to `new_cfg.leb_count`.
    ///
    /// Static volumes and type changes are refused, as are no-op and zero
    /// sizes. Shrinking retires any mapped LEB beyond the new size.
    pub fn resize_volume(&self, vol_id: u32, new_cfg: &VolumeConfig) -> Result<()> {
        let inner = &mut *self.lock();

        let allocated: u32 = inner.volumes.values().map(|v| v.cfg.leb_count).sum();
        let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;

        if vol.cfg.vol_type != VolType::Dynamic || new_cfg.vol_type != VolType::Dynamic {
            return Err(UbiError::Canceled);
        }
        let new_count = new_cfg.leb_count;
        if new_count == 0 {
            return Err(UbiError::InvalidArgument);
        }
        let old_count = vol.cfg.leb_count;
        if new_count == old_count {
            return Err(UbiError::Canceled);
        }

        if new_count > old_count {
            let grow = new_count - old_count;
            if u64::from(allocated) + u64::from(grow) > u64::from(inner.geo.leb_total()) {
                return Err(UbiError::NoSpace);
            }
        }

        let doomed: Vec<(u32, u32)> = if new_count < old_count {
            vol.eba.range(new_count..).map(|(&l, &p)| (l, p)).collect()
        } else {
            Vec::new()
        };

        if let Some(vol) = inner.volumes.get_mut(&vol_id) {
            for (lnum, _) in &doomed {
                vol.eba.remove(lnum);
            }
            vol.cfg.leb_count = new_count;
        }
        for (_, pnum) in doomed {
            inner.retire(pnum);
        }

        inner.commit()
    }

    /// Remove a volume; its mapped PEBs are retired for reclaim.
    pub fn remove_volume(&self, vol_id: u32) -> Result<()> {
        let inner = &mut *self.lock();
        let vol = inner.volumes.remove(&vol_id).ok_or(UbiError::NotFound)?;

        for (_, &pnum) in &vol.eba {
            inner.retire(pnum);
        }

        // Close the hole in the persisted header table.
        for other in inner.volumes.values_mut() {
            if other.vol_idx > vol.vol_idx {
                other.vol_idx -= 1;
            }
        }

        inner.commit()?;
        info!("volume {vol_id} removed");
        Ok(())
    }

    /// The volume's configuration and how many of its LEBs are mapped.
    pub fn volume_info(&self, vol_id: u32) -> Result<VolumeInfo> {
        let inner = self.lock();
        let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        Ok(VolumeInfo {
            config: vol.cfg.clone(),
            allocated_lebs: vol.eba.len(),
        })
    }

    /// Write a whole LEB.
    ///
    /// The data lands on a freshly allocated PEB and only then does the
    /// mapping move over; the previous copy (if any) stays intact on flash
    /// until reclaimed, so an interruption at any point leaves at least
    /// one valid copy to be found at the next mount.
    pub fn leb_write(&self, vol_id: u32, lnum: u32, data: &[u8]) -> Result<()> {
        let inner = &mut *self.lock();

        let p_old = {
            let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
            if lnum >= vol.cfg.leb_count {
                return Err(UbiError::OutOfRange);
            }
            vol.eba.get(&lnum).copied()
        };
        if data.len() > inner.geo.leb_size() {
            return Err(UbiError::NoSpace);
        }
        if inner.free.is_empty() {
            return Err(UbiError::NoSpace);
        }

        // Retire the previous copy in RAM only; its flash content stays
        // valid until the reclaimer erases it.
        if let Some(p_old) = p_old {
            if let Some(vol) = inner.volumes.get_mut(&vol_id) {
                vol.eba.remove(&lnum);
            }
            inner.retire(p_old);
        }

        let Some((_, p_new)) = inner.free.take_min() else {
            return Err(UbiError::NoSpace);
        };

        let sqnum = inner.global_seqnr;
        inner.global_seqnr += 1;

        let base = inner.geo.peb_offset(p_new);
        let vid = VidHdr::new(vol_id, lnum, data.len() as u32, sqnum);
        inner.mtd.write(base + VID_HDR_OFFSET, &vid.bytes())?;

        if !data.is_empty() {
            mtd::write_padded(&mut inner.mtd, base + DATA_OFFSET, data)?;
        }

        if let Some(vol) = inner.volumes.get_mut(&vol_id) {
            vol.eba.insert(lnum, p_new);
        }
        Ok(())
    }

    /// Map a LEB without writing any payload.
    pub fn leb_map(&self, vol_id: u32, lnum: u32) -> Result<()> {
        self.leb_write(vol_id, lnum, &[])
    }

    /// Unmap a LEB; its PEB is retired for later reclaim. Unmapping an
    /// unmapped LEB is a no-op.
    pub fn leb_unmap(&self, vol_id: u32, lnum: u32) -> Result<()> {
        let inner = &mut *self.lock();

        let unmapped = {
            let vol = inner.volumes.get_mut(&vol_id).ok_or(UbiError::NotFound)?;
            if lnum >= vol.cfg.leb_count {
                return Err(UbiError::OutOfRange);
            }
            vol.eba.remove(&lnum)
        };

        if let Some(pnum) = unmapped {
            inner.retire(pnum);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of a mapped LEB, starting at `offset` into
    /// its payload.
    pub fn leb_read(&self, vol_id: u32, lnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.cfg.leb_count {
            return Err(UbiError::OutOfRange);
        }
        let pnum = *vol.eba.get(&lnum).ok_or(UbiError::NotFound)?;

        if offset
            .checked_add(buf.len())
            .map_or(true, |end| end > inner.geo.leb_size())
        {
            return Err(UbiError::InvalidArgument);
        }

        inner
            .mtd
            .read(inner.geo.peb_offset(pnum) + DATA_OFFSET + offset as u64, buf)?;
        Ok(())
    }

    /// Is this LEB currently mapped to a PEB?
    pub fn leb_is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        let inner = self.lock();
        let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.cfg.leb_count {
            return Err(UbiError::OutOfRange);
        }
        Ok(vol.eba.contains_key(&lnum))
    }

    /// Payload length recorded by the LEB's on-flash VID header.
    pub fn leb_data_size(&self, vol_id: u32, lnum: u32) -> Result<usize> {
        let inner = self.lock();
        let vol = inner.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.cfg.leb_count {
            return Err(UbiError::OutOfRange);
        }
        let pnum = *vol.eba.get(&lnum).ok_or(UbiError::NotFound)?;

        let mut buf = [0u8; UBI_VID_HDR_SIZE];
        inner
            .mtd
            .read(inner.geo.peb_offset(pnum) + VID_HDR_OFFSET, &mut buf)?;
        let vid = VidHdr::parse(&buf).ok_or(UbiError::BadHeader)?;
        Ok(vid.data_size as usize)
    }
}

impl<M: Mtd> Inner<M> {
    /// Fresh-format path: erase and EC-stamp every data PEB, then commit an
    /// empty volume table to both banks.
    fn format(mut mtd: M, geo: Geometry) -> Result<Self> {
        info!("no valid metadata bank; formatting {} PEBs", geo.peb_count);

        let ec0 = EcHdr::new(0).bytes();
        let mut free = PebPool::default();
        for pnum in geo.data_pebs() {
            let offset = geo.peb_offset(pnum);
            mtd.erase(offset, u64::from(geo.peb_size))?;
            mtd.write(offset, &ec0)?;
            free.insert(0, pnum);
        }

        let table = MetaTable {
            revision: 0,
            volumes: Vec::new(),
        };
        let buf = meta::table_bytes(&geo, &table)?;
        meta::overwrite_both_banks(&mut mtd, &geo, &buf)?;

        Ok(Self {
            mtd,
            geo,
            revision: 0,
            global_seqnr: 0,
            vols_seqnr: 0,
            ec_avg: 0,
            free,
            dirty: PebPool::default(),
            bad: BTreeMap::new(),
            volumes: BTreeMap::new(),
        })
    }

    /// Mount-existing path: instantiate volumes from the recovered table,
    /// then scan the data region to rebuild pools and EBA tables.
    fn mount(mtd: M, geo: Geometry, table: MetaTable) -> Result<Self> {
        let mut volumes: BTreeMap<u32, UbiVolume> = BTreeMap::new();
        let mut vols_seqnr = 0;
        for (vol_idx, (vol_id, cfg)) in table.volumes.iter().enumerate() {
            vols_seqnr = vols_seqnr.max(vol_id + 1);
            let prev = volumes.insert(
                *vol_id,
                UbiVolume {
                    vol_idx: vol_idx as u32,
                    cfg: cfg.clone(),
                    eba: BTreeMap::new(),
                },
            );
            if prev.is_some() {
                return Err(UbiError::BadHeader);
            }
        }

        let vol_lebs: BTreeMap<u32, u32> =
            volumes.iter().map(|(&id, v)| (id, v.cfg.leb_count)).collect();
        let report = scan::scan(&mtd, &geo, &vol_lebs)?;

        for (vol_id, eba) in report.ebas {
            if let Some(vol) = volumes.get_mut(&vol_id) {
                vol.eba = eba;
            }
        }

        info!(
            "mounted revision {}: {} volumes, {} free / {} dirty / {} bad PEBs",
            table.revision,
            volumes.len(),
            report.free.len(),
            report.dirty.len(),
            report.bad.len()
        );

        Ok(Self {
            mtd,
            geo,
            revision: table.revision,
            // Strictly above everything persisted, so the next write's
            // sequence number is unambiguous.
            global_seqnr: report.max_sqnum + 1,
            vols_seqnr,
            ec_avg: report.ec_avg,
            free: report.free,
            dirty: report.dirty,
            bad: report.bad,
            volumes,
        })
    }

    /// Persist the volume registry via the two-phase bank overwrite.
    fn commit(&mut self) -> Result<()> {
        let mut records: Vec<(u32, u32, VolumeConfig)> = self
            .volumes
            .iter()
            .map(|(&id, v)| (v.vol_idx, id, v.cfg.clone()))
            .collect();
        records.sort_by_key(|&(vol_idx, _, _)| vol_idx);

        let table = MetaTable {
            revision: self.revision + 1,
            volumes: records.into_iter().map(|(_, id, cfg)| (id, cfg)).collect(),
        };
        let buf = meta::table_bytes(&self.geo, &table)?;
        meta::overwrite_both_banks(&mut self.mtd, &self.geo, &buf)?;
        self.revision = table.revision;
        Ok(())
    }

    /// Move a PEB that no longer backs a LEB into the dirty pool, keyed by
    /// its on-flash erase counter. A PEB whose EC header cannot be read
    /// back is quarantined instead.
    fn retire(&mut self, pnum: u32) {
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        let ec = self
            .mtd
            .read(self.geo.peb_offset(pnum), &mut buf)
            .ok()
            .and_then(|()| EcHdr::parse(&buf))
            .map(|hdr| hdr.ec);

        match ec {
            Some(ec) => self.dirty.insert(ec, pnum),
            None => {
                warn!("PEB {pnum}: EC header unreadable while retiring, quarantining");
                self.bad.insert(pnum, self.ec_avg);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtd::{MtdInfo, RamMtd};

    const TEST_INFO: MtdInfo = MtdInfo {
        partition_size: 16 * 8192,
        erase_block_size: 8192,
        write_block_size: 16,
    };

    fn open_fresh() -> Result<UbiDevice<RamMtd>> {
        UbiDevice::open(RamMtd::new(TEST_INFO))
    }

    fn static_cfg(name: &str, leb_count: u32) -> VolumeConfig {
        VolumeConfig {
            name: name.to_string(),
            vol_type: VolType::Static,
            leb_count,
        }
    }

    fn dynamic_cfg(name: &str, leb_count: u32) -> VolumeConfig {
        VolumeConfig {
            name: name.to_string(),
            vol_type: VolType::Dynamic,
            leb_count,
        }
    }

    #[test]
    fn format_and_info() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let info = dev.info();
        assert_eq!(info.leb_total, 14);
        assert_eq!(info.leb_size, 8192 - 48);
        assert_eq!(info.free_pebs, 14);
        assert_eq!(info.dirty_pebs, 0);
        assert_eq!(info.bad_pebs, 0);
        assert_eq!(info.allocated_lebs, 0);
        assert_eq!(info.volumes, 0);
        assert!(dev.peb_erase_counters()?.iter().all(|&ec| ec == 0));
        Ok(())
    }

    #[test]
    fn create_two_volumes() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v1 = dev.create_volume(&static_cfg("/ubi_0", 7))?;
        let v2 = dev.create_volume(&static_cfg("/ubi_1", 7))?;
        assert_eq!((v1, v2), (0, 1));

        let info = dev.info();
        assert_eq!(info.allocated_lebs, 14);
        assert_eq!(info.volumes, 2);
        assert_eq!(info.free_pebs, 14);
        assert_eq!(info.dirty_pebs, 0);

        // The partition is fully reserved now.
        assert!(matches!(
            dev.create_volume(&static_cfg("/ubi_2", 1)),
            Err(UbiError::NoSpace)
        ));
        Ok(())
    }

    #[test]
    fn create_volume_checks_table_capacity_up_front() -> anyhow::Result<()> {
        // 128-byte PEBs: a bank PEB fits the device header plus exactly
        // two volume headers.
        let dev = UbiDevice::open(RamMtd::new(MtdInfo {
            partition_size: 16 * 128,
            erase_block_size: 128,
            write_block_size: 16,
        }))?;
        dev.create_volume(&dynamic_cfg("a", 1))?;
        dev.create_volume(&dynamic_cfg("b", 1))?;

        assert!(matches!(
            dev.create_volume(&dynamic_cfg("c", 1)),
            Err(UbiError::NoSpace)
        ));

        // The refused create left nothing behind: no phantom volume, no
        // consumed vol_id.
        assert_eq!(dev.info().volumes, 2);
        assert!(matches!(dev.volume_info(2), Err(UbiError::NotFound)));

        let dev = UbiDevice::open(dev.close())?;
        assert_eq!(dev.info().volumes, 2);
        assert_eq!(dev.volume_info(1)?.config.name, "b");
        Ok(())
    }

    #[test]
    fn duplicate_name_returns_existing_volume() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v1 = dev.create_volume(&static_cfg("/ubi_0", 7))?;
        let again = dev.create_volume(&static_cfg("/ubi_0", 3))?;
        assert_eq!(v1, again);
        assert_eq!(dev.info().volumes, 1);
        assert_eq!(dev.volume_info(v1)?.config.leb_count, 7);
        Ok(())
    }

    #[test]
    fn write_cycle_reclaim_remount() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v1 = dev.create_volume(&static_cfg("/ubi_0", 7))?;
        let v2 = dev.create_volume(&static_cfg("/ubi_1", 7))?;

        let sizes = [1usize, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8000];
        let payloads: Vec<Vec<u8>> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                (0..n)
                    .map(|j| (i as u8).wrapping_mul(31).wrapping_add(j as u8))
                    .collect()
            })
            .collect();
        let slot = |i: usize| {
            if i < 7 {
                (v1, i as u32)
            } else {
                (v2, (i - 7) as u32)
            }
        };

        for (i, data) in payloads.iter().enumerate() {
            let (vol, lnum) = slot(i);
            dev.leb_write(vol, lnum, data)?;
        }
        assert_eq!(dev.info().free_pebs, 0);
        assert_eq!(dev.info().dirty_pebs, 0);

        for (i, data) in payloads.iter().enumerate() {
            let (vol, lnum) = slot(i);
            let mut out = vec![0u8; data.len()];
            dev.leb_read(vol, lnum, 0, &mut out)?;
            assert_eq!(&out, data);
            assert_eq!(dev.leb_data_size(vol, lnum)?, data.len());
            assert!(dev.leb_is_mapped(vol, lnum)?);
        }

        for i in 0..14 {
            let (vol, lnum) = slot(i);
            dev.leb_unmap(vol, lnum)?;
            assert!(!dev.leb_is_mapped(vol, lnum)?);
            assert!(matches!(
                dev.leb_read(vol, lnum, 0, &mut [0u8; 1]),
                Err(UbiError::NotFound)
            ));
        }
        assert_eq!(dev.info().free_pebs, 0);
        assert_eq!(dev.info().dirty_pebs, 14);

        for _ in 0..14 {
            dev.erase_peb()?;
        }
        // One extra call with nothing left to reclaim.
        dev.erase_peb()?;
        let info = dev.info();
        assert_eq!(info.free_pebs, 14);
        assert_eq!(info.dirty_pebs, 0);
        assert!(dev.peb_erase_counters()?.iter().all(|&ec| ec == 1));

        // Remount and verify the same post-state.
        let dev = UbiDevice::open(dev.close())?;
        let info = dev.info();
        assert_eq!(info.free_pebs, 14);
        assert_eq!(info.dirty_pebs, 0);
        assert_eq!(info.bad_pebs, 0);
        assert_eq!(info.allocated_lebs, 14);
        assert_eq!(info.volumes, 2);
        for i in 0..14 {
            let (vol, lnum) = slot(i);
            assert!(!dev.leb_is_mapped(vol, lnum)?);
        }
        assert!(dev.peb_erase_counters()?.iter().all(|&ec| ec == 1));
        Ok(())
    }

    #[test]
    fn overwrite_retires_previous_copy() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 1))?;
        let data = vec![0x5A; 256];

        for k in 1..=14 {
            dev.leb_write(v, 0, &data)?;
            assert_eq!(dev.info().free_pebs, 14 - k);
            assert_eq!(dev.info().dirty_pebs, k - 1);

            let mut out = vec![0u8; 256];
            dev.leb_read(v, 0, 0, &mut out)?;
            assert_eq!(out, data);
        }

        // Every free PEB has been consumed.
        assert!(matches!(
            dev.leb_write(v, 0, &data),
            Err(UbiError::NoSpace)
        ));
        Ok(())
    }

    #[test]
    fn resize_dynamic_volume() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&dynamic_cfg("settings", 2))?;
        dev.leb_write(v, 0, &[0xA5; 256])?;

        dev.resize_volume(v, &dynamic_cfg("settings", 4))?;
        let vinfo = dev.volume_info(v)?;
        assert_eq!(vinfo.config.leb_count, 4);
        assert_eq!(vinfo.allocated_lebs, 1);

        dev.leb_map(v, 2)?;
        dev.leb_map(v, 3)?;
        assert_eq!(dev.volume_info(v)?.allocated_lebs, 3);

        let dirty_before = dev.info().dirty_pebs;
        dev.resize_volume(v, &dynamic_cfg("settings", 2))?;
        let vinfo = dev.volume_info(v)?;
        assert_eq!(vinfo.config.leb_count, 2);
        assert_eq!(vinfo.allocated_lebs, 1);
        assert_eq!(dev.info().dirty_pebs, dirty_before + 2);
        assert!(matches!(
            dev.leb_read(v, 2, 0, &mut [0u8; 4]),
            Err(UbiError::OutOfRange)
        ));

        // The surviving mapping is untouched.
        let mut out = [0u8; 256];
        dev.leb_read(v, 0, 0, &mut out)?;
        assert_eq!(out, [0xA5; 256]);
        Ok(())
    }

    #[test]
    fn resize_rejections() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let s = dev.create_volume(&static_cfg("firmware", 2))?;
        let d = dev.create_volume(&dynamic_cfg("settings", 2))?;

        assert!(matches!(
            dev.resize_volume(s, &static_cfg("firmware", 4)),
            Err(UbiError::Canceled)
        ));
        assert!(matches!(
            dev.resize_volume(d, &dynamic_cfg("settings", 2)),
            Err(UbiError::Canceled)
        ));
        assert!(matches!(
            dev.resize_volume(d, &static_cfg("settings", 4)),
            Err(UbiError::Canceled)
        ));
        assert!(matches!(
            dev.resize_volume(d, &VolumeConfig { leb_count: 0, ..dynamic_cfg("settings", 0) }),
            Err(UbiError::InvalidArgument)
        ));
        // Growing past the partition's LEB total.
        assert!(matches!(
            dev.resize_volume(d, &dynamic_cfg("settings", 13)),
            Err(UbiError::NoSpace)
        ));
        assert!(matches!(
            dev.resize_volume(99, &dynamic_cfg("nope", 4)),
            Err(UbiError::NotFound)
        ));
        Ok(())
    }

    #[test]
    fn remove_volume_retires_and_compacts() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v1 = dev.create_volume(&dynamic_cfg("a", 2))?;
        let v2 = dev.create_volume(&dynamic_cfg("b", 2))?;
        let v3 = dev.create_volume(&dynamic_cfg("c", 2))?;

        dev.leb_write(v1, 0, &[1; 16])?;
        dev.leb_write(v1, 1, &[2; 16])?;
        dev.leb_write(v3, 0, &[3; 16])?;

        dev.remove_volume(v1)?;
        assert!(matches!(dev.volume_info(v1), Err(UbiError::NotFound)));
        let info = dev.info();
        assert_eq!(info.volumes, 2);
        assert_eq!(info.dirty_pebs, 2);
        assert_eq!(info.allocated_lebs, 4);

        // Remount: the survivors kept their identities and data.
        let dev = UbiDevice::open(dev.close())?;
        assert_eq!(dev.info().volumes, 2);
        assert_eq!(dev.volume_info(v2)?.config.name, "b");
        let mut out = [0u8; 16];
        dev.leb_read(v3, 0, 0, &mut out)?;
        assert_eq!(out, [3; 16]);

        // A new volume gets a never-used vol_id.
        let v4 = dev.create_volume(&dynamic_cfg("d", 2))?;
        assert!(v4 > v3);
        Ok(())
    }

    #[test]
    fn payload_capacity_boundary() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 2))?;
        let max = dev.info().leb_size;

        dev.leb_write(v, 0, &vec![0xEE; max])?;
        assert_eq!(dev.leb_data_size(v, 0)?, max);

        assert!(matches!(
            dev.leb_write(v, 1, &vec![0xEE; max + 1]),
            Err(UbiError::NoSpace)
        ));
        Ok(())
    }

    #[test]
    fn leb_bounds_and_lookups() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 2))?;

        assert!(matches!(
            dev.leb_write(v, 2, &[0; 4]),
            Err(UbiError::OutOfRange)
        ));
        assert!(matches!(
            dev.leb_is_mapped(v, 2),
            Err(UbiError::OutOfRange)
        ));
        assert!(matches!(
            dev.leb_write(99, 0, &[0; 4]),
            Err(UbiError::NotFound)
        ));
        assert!(matches!(
            dev.leb_read(v, 0, 0, &mut [0u8; 4]),
            Err(UbiError::NotFound)
        ));

        // Reads past the payload capacity are rejected up front.
        dev.leb_write(v, 0, &[7; 32])?;
        let leb_size = dev.info().leb_size;
        assert!(matches!(
            dev.leb_read(v, 0, leb_size - 1, &mut [0u8; 2]),
            Err(UbiError::InvalidArgument)
        ));

        // Offset reads see the right window.
        let mut out = [0u8; 8];
        dev.leb_read(v, 0, 8, &mut out)?;
        assert_eq!(out, [7; 8]);
        Ok(())
    }

    #[test]
    fn interrupted_overwrite_keeps_old_copy() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 1))?;
        dev.leb_write(v, 0, b"old-data........")?;

        // The overwrite's VID header never reaches flash.
        dev.lock().mtd.fail_writes_after(0);
        assert!(dev.leb_write(v, 0, b"new-data........").is_err());

        let dev = UbiDevice::open(dev.close())?;
        assert!(dev.leb_is_mapped(v, 0)?);
        let mut out = [0u8; 16];
        dev.leb_read(v, 0, 0, &mut out)?;
        assert_eq!(&out, b"old-data........");

        // The aborted target PEB scans as free again; nothing was lost.
        let info = dev.info();
        assert_eq!(info.free_pebs, 13);
        assert_eq!(info.dirty_pebs, 0);
        assert_eq!(info.bad_pebs, 0);
        Ok(())
    }

    #[test]
    fn interrupted_overwrite_after_vid_lands() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 1))?;
        dev.leb_write(v, 0, &[0x11; 64])?;

        // VID header lands, payload write fails: the new claim is durable,
        // so after remount it wins and the superseded copy is retired.
        dev.lock().mtd.fail_writes_after(1);
        assert!(dev.leb_write(v, 0, &[0x22; 64]).is_err());

        let dev = UbiDevice::open(dev.close())?;
        assert!(dev.leb_is_mapped(v, 0)?);
        assert_eq!(dev.leb_data_size(v, 0)?, 64);
        let info = dev.info();
        assert_eq!(info.free_pebs, 12);
        assert_eq!(info.dirty_pebs, 1);
        Ok(())
    }

    #[test]
    fn failed_commit_rolls_back_on_remount() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        dev.create_volume(&static_cfg("/ubi_0", 2))?;

        // The commit's bank 0 write fails after the erase; bank 1 still
        // carries the previous table.
        dev.lock().mtd.fail_writes_after(0);
        assert!(dev.create_volume(&static_cfg("/ubi_1", 2)).is_err());

        let dev = UbiDevice::open(dev.close())?;
        assert_eq!(dev.info().volumes, 1);
        assert_eq!(dev.volume_info(0)?.config.name, "/ubi_0");
        Ok(())
    }

    #[test]
    fn mount_resolves_duplicate_claims() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 4))?;
        let mut raw = dev.close();

        // Hand two free PEBs competing VID claims for (v, 0).
        let geo = Geometry::new(&raw.info())?;
        for (pnum, sqnum, data_size) in [(4u32, 100u64, 11u32), (5, 101, 22)] {
            let vid = VidHdr::new(v, 0, data_size, sqnum);
            raw.write(geo.peb_offset(pnum) + VID_HDR_OFFSET, &vid.bytes())?;
        }

        let dev = UbiDevice::open(raw)?;
        assert!(dev.leb_is_mapped(v, 0)?);
        assert_eq!(dev.leb_data_size(v, 0)?, 22);
        let info = dev.info();
        assert_eq!(info.free_pebs, 12);
        assert_eq!(info.dirty_pebs, 1);
        assert!(dev.lock().global_seqnr >= 102);
        Ok(())
    }

    #[test]
    fn failed_erase_quarantines_peb() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 1))?;
        dev.leb_write(v, 0, &[1; 16])?;
        dev.leb_unmap(v, 0)?;

        dev.lock().mtd.fail_erases_after(0);
        assert!(dev.erase_peb().is_err());

        let info = dev.info();
        assert_eq!(info.bad_pebs, 1);
        assert_eq!(info.dirty_pebs, 0);
        assert_eq!(info.free_pebs, 13);

        // The quarantined PEB is never handed out again.
        dev.erase_peb()?;
        assert_eq!(dev.info().bad_pebs, 1);
        Ok(())
    }

    #[test]
    fn quarantined_peb_reports_last_known_counter() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&static_cfg("/ubi_0", 1))?;
        dev.leb_write(v, 0, &[1; 16])?;
        dev.leb_unmap(v, 0)?;

        // The reclaim's erase succeeds but the fresh EC header write
        // fails: the PEB is quarantined while physically left all-0xFF.
        dev.lock().mtd.fail_writes_after(0);
        assert!(dev.erase_peb().is_err());
        assert_eq!(dev.info().bad_pebs, 1);

        // Wear audits still cover the whole data region, with the bad
        // PEB's last-known counter standing in.
        let counters = dev.peb_erase_counters()?;
        assert_eq!(counters.len(), 14);
        assert_eq!(counters.iter().filter(|&&ec| ec == 1).count(), 1);
        assert_eq!(counters.iter().filter(|&&ec| ec == 0).count(), 13);
        Ok(())
    }

    #[test]
    fn wear_levels_across_cycles() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&dynamic_cfg("wear", 14))?;

        for cycle in 1..=3u32 {
            for lnum in 0..14 {
                dev.leb_write(v, lnum, &[cycle as u8; 32])?;
            }
            for lnum in 0..14 {
                dev.leb_unmap(v, lnum)?;
            }
            for _ in 0..14 {
                dev.erase_peb()?;
            }
            assert!(dev.peb_erase_counters()?.iter().all(|&ec| ec == cycle));
        }
        Ok(())
    }

    #[test]
    fn mount_is_idempotent() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v1 = dev.create_volume(&dynamic_cfg("a", 3))?;
        let v2 = dev.create_volume(&static_cfg("b", 4))?;
        dev.leb_write(v1, 0, &[1; 100])?;
        dev.leb_write(v1, 2, &[2; 200])?;
        dev.leb_write(v2, 1, &[3; 300])?;
        dev.leb_write(v1, 0, &[4; 150])?; // leaves one dirty PEB behind

        let before = dev.info();
        let dev = UbiDevice::open(dev.close())?;
        assert_eq!(dev.info(), before);

        let dev = UbiDevice::open(dev.close())?;
        assert_eq!(dev.info(), before);
        for (vol, lnum, byte, len) in [(v1, 0, 4u8, 150), (v1, 2, 2, 200), (v2, 1, 3, 300)] {
            let mut out = vec![0u8; len];
            dev.leb_read(vol, lnum, 0, &mut out)?;
            assert_eq!(out, vec![byte; len]);
            assert_eq!(dev.leb_data_size(vol, lnum)?, len);
        }
        Ok(())
    }

    #[test]
    fn sequence_numbers_stay_monotonic_across_remounts() -> anyhow::Result<()> {
        let dev = open_fresh()?;
        let v = dev.create_volume(&dynamic_cfg("seq", 2))?;
        dev.leb_write(v, 0, &[1; 8])?;
        dev.leb_write(v, 1, &[2; 8])?;
        let seq = dev.lock().global_seqnr;

        let dev = UbiDevice::open(dev.close())?;
        assert!(dev.lock().global_seqnr >= seq);

        dev.leb_write(v, 0, &[3; 8])?;
        // The overwrite must outrank both persisted copies.
        let dev = UbiDevice::open(dev.close())?;
        let mut out = [0u8; 8];
        dev.leb_read(v, 0, 0, &mut out)?;
        assert_eq!(out, [3; 8]);
        Ok(())
    }
}
