//! Mount-time scan: rebuild the PEB pools and the per-volume EBA tables
//! from the data region.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::warn;

use crate::error::Result;
use crate::geom::Geometry;
use crate::headers::{EcHdr, ParseHeader, VidHdr, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE};
use crate::mtd::{Mtd, SliceUtil};
use crate::pools::PebPool;

/// Everything mount needs to know after scanning the data region.
#[derive(Debug, Default)]
pub(crate) struct ScanReport {
    pub free: PebPool,
    pub dirty: PebPool,
    /// Quarantined PEBs and their last-known erase counters.
    pub bad: BTreeMap<u32, u32>,
    /// Reconstructed EBA tables: vol_id → (lnum → pnum).
    pub ebas: BTreeMap<u32, BTreeMap<u32, u32>>,
    /// Highest sequence number seen in any valid VID header.
    pub max_sqnum: u64,
    /// Mean erase count across readable EC headers, the stand-in value
    /// when a PEB is quarantined without one.
    pub ec_avg: u32,
}

struct Claim {
    pnum: u32,
    ec: u32,
    sqnum: u64,
}

/// Scan every data-region PEB and classify it.
///
/// `vol_lebs` maps each known vol_id to its LEB count. A valid VID header
/// pointing at an unknown volume or an out-of-range LEB retires its PEB to
/// the dirty pool; when two PEBs claim the same LEB, the strictly greater
/// sequence number wins and the loser is retired.
pub(crate) fn scan<M: Mtd>(
    mtd: &M,
    geo: &Geometry,
    vol_lebs: &BTreeMap<u32, u32>,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();

    // First pass: mean erase count.
    let mut ec_sum: u64 = 0;
    let mut ec_count: u64 = 0;
    let mut buf = [0u8; UBI_EC_HDR_SIZE];
    for pnum in geo.data_pebs() {
        mtd.read(geo.peb_offset(pnum), &mut buf)?;
        if let Some(hdr) = EcHdr::parse(&buf) {
            ec_sum += u64::from(hdr.ec);
            ec_count += 1;
        }
    }
    // Rounded to nearest; 0 if no PEB has a readable EC header.
    report.ec_avg = (ec_sum + ec_count / 2).checked_div(ec_count).unwrap_or(0) as u32;

    // Second pass: classify each PEB.
    let mut claims: BTreeMap<u32, BTreeMap<u32, Claim>> = BTreeMap::new();
    let mut buf = [0u8; UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE];
    for pnum in geo.data_pebs() {
        mtd.read(geo.peb_offset(pnum), &mut buf)?;

        let Some(ec_hdr) = EcHdr::parse(&buf[..UBI_EC_HDR_SIZE]) else {
            warn!("PEB {pnum}: unreadable EC header, quarantining");
            report.bad.insert(pnum, report.ec_avg);
            continue;
        };
        let ec = ec_hdr.ec;

        let vid_region = &buf[UBI_EC_HDR_SIZE..];
        if vid_region.is_erased() {
            report.free.insert(ec, pnum);
            continue;
        }

        let Some(vid) = VidHdr::parse(vid_region) else {
            warn!("PEB {pnum}: unreadable VID header, quarantining");
            report.bad.insert(pnum, ec);
            continue;
        };

        report.max_sqnum = report.max_sqnum.max(vid.sqnum);

        let Some(&leb_count) = vol_lebs.get(&vid.vol_id) else {
            report.dirty.insert(ec, pnum);
            continue;
        };
        if vid.lnum >= leb_count {
            report.dirty.insert(ec, pnum);
            continue;
        }

        match claims.entry(vid.vol_id).or_default().entry(vid.lnum) {
            Entry::Vacant(slot) => {
                slot.insert(Claim {
                    pnum,
                    ec,
                    sqnum: vid.sqnum,
                });
            }
            Entry::Occupied(mut slot) => {
                let held_pnum = slot.get().pnum;
                let held_sqnum = slot.get().sqnum;
                if vid.sqnum > held_sqnum {
                    let loser = slot.insert(Claim {
                        pnum,
                        ec,
                        sqnum: vid.sqnum,
                    });
                    report.dirty.insert(loser.ec, loser.pnum);
                } else {
                    if vid.sqnum == held_sqnum {
                        // Cannot happen for correctly generated writes;
                        // keep the first-discovered copy.
                        warn!(
                            "PEBs {held_pnum} and {pnum} claim LEB {} of volume {} with equal sqnum {}",
                            vid.lnum, vid.vol_id, vid.sqnum
                        );
                    }
                    report.dirty.insert(ec, pnum);
                }
            }
        }
    }

    for (vol_id, by_lnum) in claims {
        let eba = report.ebas.entry(vol_id).or_default();
        for (lnum, claim) in by_lnum {
            eba.insert(lnum, claim.pnum);
        }
    }

    Ok(report)
}
