//! An attached UBI container: the erase block table, the volume table held by the two layout
//! blocks, and the counters every header write needs.

use std::collections::HashMap;

use log::{debug, warn};

use super::headers::*;
use super::scan::{scan_blocks, BlockContent, Ebt};
use super::vtbl::VolumeTable;
use super::{
    UBI_BEB_LIMIT_PER_1024, UBI_EBA_RESERVED_PEBS, UBI_LAYOUT_VOLUME_COMPAT,
    UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_WL_RESERVED_PEBS,
};
use crate::error::{Error, Result};
use crate::nand::Nand;
use crate::partition::Partition;

/// Bytes left for payload in each PEB of `part`, once the EC and VID header pages are taken
pub(crate) fn peb_capacity<N: Nand>(part: &Partition<N>) -> Result<u32> {
    let page_size = part.page_size();
    if page_size < UBI_EC_HDR_SIZE {
        return Err(Error::Unsupported(format!(
            "{page_size}-byte pages cannot hold a UBI header"
        )));
    }

    part.block_size()
        .checked_sub(2 * page_size)
        .filter(|&x| x > 0)
        .and_then(|x| u32::try_from(x).ok())
        .ok_or_else(|| {
            Error::Unsupported(format!(
                "{}-byte erase blocks leave no room for UBI data",
                part.block_size()
            ))
        })
}

/// The most common `image_seq` among the EC headers in `blocks`
pub(crate) fn common_image_seq<'a>(
    blocks: impl Iterator<Item = &'a BlockContent>,
) -> Option<u32> {
    let mut image_seq_ctrs = HashMap::new();
    for ec in blocks.filter_map(BlockContent::ec) {
        *image_seq_ctrs.entry(ec.image_seq).or_insert(0u32) += 1;
    }

    image_seq_ctrs
        .into_iter()
        .max_by_key(|&(_, v)| v)
        .map(|(k, _)| k)
}

#[derive(Debug)]
pub struct Container {
    pub(crate) ebt: Ebt,
    pub(crate) vtbl: VolumeTable,

    /// The PEBs holding volume table copies 0 and 1
    pub(crate) layout: [Option<u32>; UBI_LAYOUT_VOLUME_EBS as usize],

    next_sqnum: u64,
    image_seq: u32,
    page_size: u32,
    capacity: u32,

    /// Offset windows have a fixed set of blocks: no bad-block reserve, no relocation
    fixed_window: bool,
}

impl Container {
    /// A container with no volumes over an already-scanned `ebt`
    pub(crate) fn empty<N: Nand>(part: &Partition<N>, ebt: Ebt, image_seq: u32) -> Result<Self> {
        let capacity = peb_capacity(part)?;

        Ok(Self {
            ebt,
            vtbl: VolumeTable::new(capacity)?,
            layout: [None; UBI_LAYOUT_VOLUME_EBS as usize],
            next_sqnum: 1,
            image_seq,
            page_size: part.page_size() as u32,
            capacity,
            fixed_window: part.window.is_offset(),
        })
    }

    /// Scan the partition's current window and load the volume table.
    ///
    /// At least one layout copy must validate; a damaged copy is reported and left for the next
    /// table write to repair. Fails with `Format` if no copy is usable.
    pub(crate) fn attach<N: Nand>(part: &mut Partition<N>) -> Result<Self> {
        peb_capacity(part)?;
        let ebt = scan_blocks(part)?;
        let image_seq = common_image_seq(ebt.iter()).unwrap_or(0);
        let mut container = Self::empty(part, ebt, image_seq)?;

        let mut layout_sqnum = [0u64; UBI_LAYOUT_VOLUME_EBS as usize];
        let mut max_sqnum = 0;
        for (peb, content) in container.ebt.iter().enumerate() {
            let Some(vid) = content.vid() else { continue };
            max_sqnum = max_sqnum.max(vid.sqnum);

            if vid.vol_id != UBI_LAYOUT_VOLUME_ID {
                continue;
            }
            let Some(slot) = container.layout.get_mut(vid.lnum as usize) else {
                continue;
            };
            if slot.is_none() || vid.sqnum > layout_sqnum[vid.lnum as usize] {
                *slot = Some(peb as u32);
                layout_sqnum[vid.lnum as usize] = vid.sqnum;
            }
        }
        container.next_sqnum = max_sqnum + 1;

        let mut vtbl: Option<VolumeTable> = None;
        for (copy, peb) in container.layout.into_iter().enumerate() {
            let Some(peb) = peb else {
                warn!("volume table copy {copy} is missing");
                continue;
            };

            match container.read_vtbl(part, peb) {
                Ok(table) => match &vtbl {
                    None => vtbl = Some(table),
                    Some(first) if *first != table => {
                        warn!("volume table copy {copy} in PEB {peb} differs from copy 0")
                    }
                    Some(_) => (),
                },
                Err(e) if e.is_format() => {
                    warn!("volume table copy {copy} in PEB {peb} is unusable: {e}")
                }
                Err(e) => return Err(e),
            }
        }

        container.vtbl =
            vtbl.ok_or_else(|| Error::Format("no valid volume table copy found".into()))?;
        container.drop_stale();

        debug!(
            "attached UBI container: {} PEBs, {} volumes, {} free, {} bad",
            container.ebt.len(),
            container.vtbl.iter().count(),
            container.free_blocks(),
            container.bad_blocks()
        );

        Ok(container)
    }

    /// Demote blocks whose data is no longer live (superseded by a higher sqnum, outside the
    /// owning volume's reservation, or belonging to no volume) to free blocks.
    fn drop_stale(&mut self) {
        let mut owners: HashMap<(u32, u32), (u32, u64)> = HashMap::new();
        let mut stale = Vec::new();

        for (peb, content) in self.ebt.iter().enumerate() {
            let peb = peb as u32;
            let Some(vid) = content.vid() else { continue };

            if vid.vol_id == UBI_LAYOUT_VOLUME_ID {
                if !self.layout.contains(&Some(peb)) {
                    stale.push(peb);
                }
                continue;
            }

            let live = self
                .vtbl
                .get(vid.vol_id)
                .is_some_and(|record| vid.lnum < record.reserved_pebs);
            if !live {
                stale.push(peb);
                continue;
            }

            match owners.get(&(vid.vol_id, vid.lnum)).copied() {
                Some((_, sqnum)) if sqnum > vid.sqnum => stale.push(peb),
                previous => {
                    if let Some((loser, _)) = previous {
                        stale.push(loser);
                    }
                    owners.insert((vid.vol_id, vid.lnum), (peb, vid.sqnum));
                }
            }
        }

        for peb in stale {
            debug!("PEB {peb} holds stale data");
            if let Some(ec) = self.ebt[peb as usize].ec() {
                self.ebt[peb as usize] = BlockContent::EcData(ec, None);
            }
        }
    }

    pub(crate) fn data_offset(&self) -> u32 {
        2 * self.page_size
    }

    /// Usable bytes per PEB
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn image_seq(&self) -> u32 {
        self.image_seq
    }

    fn read_vtbl<N: Nand>(&self, part: &mut Partition<N>, peb: u32) -> Result<VolumeTable> {
        let mut buf = vec![0u8; self.vtbl.byte_len()];
        part.peb_read(peb, self.data_offset(), &mut buf)?;
        VolumeTable::decode(&buf, self.capacity)
    }

    /// A fresh sequence number, higher than any on the medium
    pub(crate) fn take_sqnum(&mut self) -> u64 {
        let sqnum = self.next_sqnum;
        self.next_sqnum += 1;
        sqnum
    }

    /// The EC header to write after erasing `peb`
    fn next_ec(&self, peb: u32) -> Ec {
        let proto = Ec {
            ec: 0,
            vid_hdr_offset: self.page_size,
            data_offset: self.data_offset(),
            image_seq: self.image_seq,
        };

        match self.ebt[peb as usize].ec() {
            Some(old) => proto.ec(old.ec).inc_ec(),
            None => proto,
        }
    }

    pub(crate) fn layout_vid(&mut self, lnum: u32) -> Vid {
        Vid {
            vol_type: VolType::Dynamic,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            lnum,
            ..Default::default()
        }
        .sqnum(self.take_sqnum())
    }

    /// Lay out a block image in `buf`: EC header page (filled in by [Self::try_place]), then
    /// the VID header page and payload if `vid` is given. Returns the image length, in whole
    /// pages.
    fn compose(&self, buf: &mut [u8], vid: Option<&Vid>, payload: &[u8]) -> Result<usize> {
        let page_size = self.page_size as usize;
        if payload.len() > self.capacity as usize {
            return Err(Error::BadParameter(format!(
                "{} bytes exceed the {}-byte PEB capacity",
                payload.len(),
                self.capacity
            )));
        }

        buf[..page_size].fill(0);
        let Some(vid) = vid else {
            return Ok(page_size);
        };

        let data_offset = self.data_offset() as usize;
        buf[page_size..data_offset].fill(0);
        vid.encode(&mut buf[page_size..data_offset])?;

        let end = data_offset + payload.len();
        buf[data_offset..end].copy_from_slice(payload);
        buf[end..].fill(0xFF);

        Ok(end.next_multiple_of(page_size))
    }

    /// Erase `peb` and program `image` with a fresh EC header. On an I/O failure the block is
    /// retired and `false` returned.
    fn try_place<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        peb: u32,
        image: &mut [u8],
        vid: Option<Vid>,
    ) -> Result<bool> {
        let ec = self.next_ec(peb);
        ec.encode(&mut image[..UBI_EC_HDR_SIZE])?;

        match part.peb_store(peb, image) {
            Ok(()) => {
                self.ebt[peb as usize] = match vid {
                    Some(vid) => BlockContent::EcData(ec, Some(vid)),
                    None => BlockContent::EcErased(ec),
                };
                Ok(true)
            }
            Err(e) if e.is_io() => {
                warn!("writing PEB {peb} failed: {e}");
                if !part.peb_retire(peb)? {
                    return Err(e);
                }
                self.ebt[peb as usize] = BlockContent::Bad;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [Self::try_place], but keep moving to freshly allocated blocks until the image is
    /// written. Returns the PEB that holds it.
    pub(crate) fn place<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        mut peb: u32,
        image: &mut [u8],
        vid: Option<Vid>,
    ) -> Result<u32> {
        while !self.try_place(part, peb, image, vid)? {
            peb = self.allocate(part)?;
            debug!("relocating to PEB {peb}");
        }
        Ok(peb)
    }

    /// Write one block once; `false` if the block failed and was retired
    pub(crate) fn try_store<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        peb: u32,
        vid: Option<Vid>,
        payload: &[u8],
    ) -> Result<bool> {
        part.with_scratch(|part, buf| {
            let len = self.compose(buf, vid.as_ref(), payload)?;
            self.try_place(part, peb, &mut buf[..len], vid)
        })
    }

    /// Write one block, relocating on failure. Returns the PEB that holds it.
    pub(crate) fn store<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        peb: u32,
        vid: Option<Vid>,
        payload: &[u8],
    ) -> Result<u32> {
        part.with_scratch(|part, buf| {
            let len = self.compose(buf, vid.as_ref(), payload)?;
            self.place(part, peb, &mut buf[..len], vid)
        })
    }

    /// Return `peb` to the free pool: erase it and write back only its EC header
    pub(crate) fn release<N: Nand>(&mut self, part: &mut Partition<N>, peb: u32) -> Result<()> {
        let mut page = vec![0u8; self.page_size as usize];
        if !self.try_place(part, peb, &mut page, None)? {
            debug!("PEB {peb} retired instead of released");
        }
        Ok(())
    }

    /// Write both volume table copies from the in-memory table. A copy that failed validation
    /// at attach time is repaired here.
    pub(crate) fn write_vtbl<N: Nand>(&mut self, part: &mut Partition<N>) -> Result<()> {
        let payload = self.vtbl.encode()?;

        for lnum in 0..UBI_LAYOUT_VOLUME_EBS {
            let peb = match self.layout[lnum as usize] {
                Some(peb) => peb,
                None => self.allocate(part)?,
            };
            let vid = self.layout_vid(lnum);
            let peb = self.store(part, peb, Some(vid), &payload)?;
            self.layout[lnum as usize] = Some(peb);
        }

        debug!("volume table written to PEBs {:?}", self.layout);
        Ok(())
    }

    /// Can `peb` be handed out for new data?
    pub(crate) fn is_free(&self, peb: u32) -> bool {
        let free = matches!(
            self.ebt[peb as usize],
            BlockContent::Erased
                | BlockContent::EcErased(_)
                | BlockContent::EcData(_, None)
                | BlockContent::Garbage
        );
        free && !self.layout.contains(&Some(peb))
    }

    pub fn free_blocks(&self) -> u32 {
        (0..self.ebt.len() as u32)
            .filter(|&peb| self.is_free(peb))
            .count() as u32
    }

    pub fn used_blocks(&self) -> u32 {
        self.ebt.iter().filter(|x| x.vid().is_some()).count() as u32
    }

    pub fn bad_blocks(&self) -> u32 {
        self.ebt
            .iter()
            .filter(|&&x| x == BlockContent::Bad)
            .count() as u32
    }

    /// How many more PEBs volumes may reserve: the good blocks, less the layout blocks, every
    /// volume's reservation, the bad-block reserve and the two spares.
    pub fn available_blocks(&self) -> u32 {
        let total = self.ebt.len() as u32;
        let bad = self.bad_blocks();
        let reserved: u32 = self.vtbl.iter().map(|(_, r)| r.reserved_pebs).sum();

        let margin = if self.fixed_window {
            0
        } else {
            let beb_limit = (u64::from(total) * UBI_BEB_LIMIT_PER_1024).div_ceil(1024) as u32;
            beb_limit.saturating_sub(bad) + UBI_WL_RESERVED_PEBS + UBI_EBA_RESERVED_PEBS
        };

        (total - bad).saturating_sub(UBI_LAYOUT_VOLUME_EBS + reserved + margin)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};
    use crate::partition::OpenMode;
    use crate::ubi::ContainerOptions;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    fn formatted() -> anyhow::Result<Partition<SimNand>> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR | OpenMode::UBI)?;
        part.create_container(&ContainerOptions::new())?;
        Ok(part)
    }

    #[test]
    fn test_capacity() -> anyhow::Result<()> {
        let part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::READ)?;
        assert_eq!(peb_capacity(&part)?, 2048 - 256);

        let tiny = NandLayout {
            blocks: 4,
            pages_per_block: 2,
            bytes_per_page: 128,
        };
        let part = Partition::open(SimNand::new(tiny), OpenMode::READ)?;
        assert!(matches!(peb_capacity(&part), Err(Error::Unsupported(_))));

        Ok(())
    }

    #[test]
    fn test_attach_fresh() -> anyhow::Result<()> {
        let mut part = formatted()?;
        let container = Container::attach(&mut part)?;

        assert_eq!(container.layout, [Some(0), Some(1)]);
        assert_eq!(container.vtbl, VolumeTable::new(container.capacity())?);
        assert_eq!(container.next_sqnum, 3);
        assert_eq!(container.free_blocks(), 14);
        assert_eq!(container.used_blocks(), 2);
        // 16 good, 2 layout, 1 bad-block reserve, 2 spares
        assert_eq!(container.available_blocks(), 11);

        Ok(())
    }

    #[test]
    fn test_attach_unformatted() -> anyhow::Result<()> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::READ | OpenMode::UBI)?;
        let err = Container::attach(&mut part).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.is_format());
        Ok(())
    }

    #[test]
    fn test_higher_sqnum_wins() -> anyhow::Result<()> {
        let mut part = formatted()?;

        // A newer copy 0 of the layout volume, e.g. left behind by an interrupted update
        let mut container = Container::attach(&mut part)?;
        let vid = container.layout_vid(0);
        let payload = container.vtbl.encode()?;
        assert!(container.try_store(&mut part, 5, Some(vid), &payload)?);

        let container = Container::attach(&mut part)?;
        assert_eq!(container.layout, [Some(5), Some(1)]);
        // The superseded copy is free again
        assert!(container.is_free(0));
        assert_eq!(container.next_sqnum, vid.sqnum + 1);

        Ok(())
    }

    #[test]
    fn test_release_failure_retires() -> anyhow::Result<()> {
        let part = formatted()?;
        let mut nand = part.close();
        nand.fail_erase(7)?;

        let mut part = Partition::open(nand, OpenMode::RDWR | OpenMode::UBI)?;
        let mut container = Container::attach(&mut part)?;
        let before = container.ebt[7].ec();
        assert!(before.is_some());

        container.release(&mut part, 7)?;
        assert_eq!(container.ebt[7], BlockContent::Bad);
        assert!(part.check_bad(7)?);

        container.release(&mut part, 8)?;
        assert_eq!(
            container.ebt[8].ec().map(|x| x.ec),
            before.map(|x| x.ec + 1)
        );

        let mut nand = part.close();
        assert!(nand.block(7)?.is_none());
        Ok(())
    }
}
