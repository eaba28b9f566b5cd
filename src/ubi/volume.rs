//! Volume lifecycle: discovering, scanning, creating and deleting volumes, and block/byte I/O on
//! a scanned one.
//!
//! A scanned volume may reserve more PEBs than it has mapped: creating a volume reserves its
//! whole size up front but maps only its first block, and later blocks are mapped as they are
//! written.

use std::num::NonZeroU32;

use log::{debug, info};

use super::container::Container;
use super::headers::{
    VolTableRecord, VolType, Vid, UBI_CRC, UBI_VOL_NAME_MAX, UBI_VTBL_AUTORESIZE_FLG,
    UBI_VTBL_SKIP_CRC_CHECK_FLG,
};
use super::overlay::Overlay;
use crate::error::{Error, Result};
use crate::nand::Nand;
use crate::partition::{OpenMode, Partition, State};

/// A volume to be created with [Partition::create_volume]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVolume {
    vtype: VolType,
    id: Option<u32>,
    size: u64,
    name: String,
    flags: u8,
    alignment: NonZeroU32,
}

impl NewVolume {
    /// Begin describing a new volume, of a given type and name
    pub fn new<S: Into<String>>(vtype: VolType, name: S) -> Self {
        Self {
            vtype,
            id: None,
            size: 0,
            name: name.into(),
            flags: 0,
            alignment: NonZeroU32::MIN,
        }
    }

    /// Choose the volume ID, instead of taking the first unused one
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the size, in bytes, reserved for the volume.
    ///
    /// The reservation is rounded up to a whole number of LEBs. The default is 0.
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    /// Set the UBI "autoresize" flag.
    pub fn autoresize(mut self) -> Self {
        self.flags |= UBI_VTBL_AUTORESIZE_FLG;
        self
    }

    /// Set the UBI "skip CRC check" flag.
    pub fn skipcheck(mut self) -> Self {
        self.flags |= UBI_VTBL_SKIP_CRC_CHECK_FLG;
        self
    }

    /// Set the alignment of the volume. All LEBs will be a multiple of this size.
    ///
    /// The default alignment is 1.
    pub fn align(mut self, alignment: NonZeroU32) -> Self {
        self.alignment = alignment;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::BadParameter("volume name is empty".into()));
        }
        if self.name.len() > UBI_VOL_NAME_MAX {
            return Err(Error::BadParameter(format!(
                "volume name {:?} longer than {UBI_VOL_NAME_MAX} bytes",
                self.name
            )));
        }
        Ok(())
    }
}

/// LEBs needed to hold `size` bytes
fn lebs_for(size: u64, leb_size: u32) -> Result<u32> {
    u32::try_from(size.div_ceil(u64::from(leb_size)))
        .map_err(|_| Error::BadParameter(format!("volume size {size} is too large")))
}

/// A scanned volume: its LEB table and the container it lives in
#[derive(Debug)]
pub struct VolumeScan {
    container: Container,
    vol_id: u32,
    record: VolTableRecord,
    lebs: Vec<Option<u32>>,
}

impl VolumeScan {
    fn new(container: Container, vol_id: u32) -> Result<Self> {
        let record = container.vtbl.get(vol_id).cloned().ok_or_else(|| {
            Error::Format(format!("volume {vol_id} has no volume table entry"))
        })?;

        let rpt = howudoin::new()
            .label("Scanning volume")
            .set_len(container.ebt.len() as u64);

        let mut lebs = vec![None; record.reserved_pebs as usize];
        for (peb, content) in container.ebt.iter().enumerate() {
            rpt.inc();
            match content.vid() {
                Some(vid) if vid.vol_id == vol_id => {
                    if let Some(slot) = lebs.get_mut(vid.lnum as usize) {
                        *slot = Some(peb as u32);
                    }
                }
                _ => (),
            }
        }
        rpt.close();

        let scan = Self {
            container,
            vol_id,
            record,
            lebs,
        };
        debug!(
            "scanned volume {vol_id} {:?}: {} of {} LEBs mapped, {} bytes",
            scan.record.name,
            scan.mapped_blocks(),
            scan.reserved_blocks(),
            scan.declared_size()
        );
        Ok(scan)
    }

    pub fn vol_id(&self) -> u32 {
        self.vol_id
    }

    /// The volume's entry in the volume table
    pub fn record(&self) -> &VolTableRecord {
        &self.record
    }

    pub fn reserved_blocks(&self) -> u32 {
        self.record.reserved_pebs
    }

    pub fn mapped_blocks(&self) -> u32 {
        self.lebs.iter().flatten().count() as u32
    }

    /// The PEB behind `leb`, if it is mapped
    pub fn peb_of(&self, leb: u32) -> Option<u32> {
        self.lebs.get(leb as usize).copied().flatten()
    }

    /// Usable bytes per LEB, after alignment padding
    pub fn leb_size(&self) -> u32 {
        self.container.capacity() - self.record.data_pad
    }

    /// Bytes of data the volume holds: for static volumes, the sum of every block's payload
    /// size; for dynamic ones, every mapped block counts in full.
    pub fn declared_size(&self) -> u64 {
        match self.record.vol_type {
            VolType::Static => self
                .lebs
                .iter()
                .flatten()
                .filter_map(|&peb| self.vid_at(peb))
                .map(|vid| u64::from(vid.data_size))
                .sum(),
            VolType::Dynamic => u64::from(self.mapped_blocks()) * u64::from(self.leb_size()),
        }
    }

    /// Free PEBs in the whole container
    pub fn free_blocks(&self) -> u32 {
        self.container.free_blocks()
    }

    /// PEBs holding live data in the whole container, layout blocks included
    pub fn used_blocks(&self) -> u32 {
        self.container.used_blocks()
    }

    pub fn bad_blocks(&self) -> u32 {
        self.container.bad_blocks()
    }

    /// PEBs any volume could still reserve
    pub fn available_blocks(&self) -> u32 {
        self.container.available_blocks()
    }

    /// Every volume in the container, as (id, name)
    pub fn volumes(&self) -> Vec<(u32, String)> {
        list(&self.container)
    }

    fn vid_at(&self, peb: u32) -> Option<Vid> {
        self.container.ebt[peb as usize].vid().copied()
    }

    fn is_static(&self) -> bool {
        self.record.vol_type == VolType::Static
    }

    /// Store the in-memory record in both volume table copies
    fn commit_record<N: Nand>(&mut self, part: &mut Partition<N>) -> Result<()> {
        self.container.vtbl.set(self.vol_id, self.record.clone())?;
        self.container.write_vtbl(part)
    }

    fn read_leb<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        leb: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let reserved = self.reserved_blocks();
        if leb >= reserved {
            return Err(Error::out_of_range("LEB", leb, reserved));
        }
        let peb = self.peb_of(leb).ok_or_else(|| {
            Error::NotPermitted(format!("LEB {leb} of volume {} is not mapped", self.vol_id))
        })?;

        let (limit, vid) = match self.is_static() {
            true => {
                let vid = self
                    .vid_at(peb)
                    .ok_or_else(|| Error::Fault(format!("PEB {peb} lost its VID header")))?;
                (vid.data_size, Some(vid))
            }
            false => (self.leb_size(), None),
        };

        let len = buf.len().min(limit.saturating_sub(offset) as usize);
        if len == 0 {
            return Ok(0);
        }

        let buf = &mut buf[..len];
        part.peb_read(peb, self.container.data_offset() + offset, buf)?;

        let check_crc = self.record.flags & UBI_VTBL_SKIP_CRC_CHECK_FLG == 0;
        if let Some(vid) = vid.filter(|x| check_crc && offset == 0 && len == x.data_size as usize) {
            if UBI_CRC.checksum(buf) != vid.data_crc {
                return Err(Error::Fault(format!(
                    "data CRC mismatch in LEB {leb} of volume {}",
                    self.vol_id
                )));
            }
        }

        Ok(len)
    }

    fn read_bytes<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let leb_size = u64::from(self.leb_size());
        let mut done = 0;

        while done < buf.len() {
            let pos = offset + done as u64;
            let leb = u32::try_from(pos / leb_size)
                .map_err(|_| Error::out_of_range("offset", pos, leb_size * u64::from(u32::MAX)))?;
            let inner = (pos % leb_size) as u32;
            let want = (buf.len() - done).min((leb_size - u64::from(inner)) as usize);

            match self.read_leb(part, leb, inner, &mut buf[done..done + want]) {
                Ok(len) => {
                    done += len;
                    if len < want {
                        break;
                    }
                }
                Err(e) if done > 0 => {
                    debug!("read of volume {} stopped after {done} bytes: {e}", self.vol_id);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(done)
    }

    /// Rewrite the VID header of `leb` with `update` applied (and a fresh sqnum), keeping its
    /// payload. `update` sees the payload and returns whether anything changed.
    fn rewrite_header<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        leb: u32,
        update: impl FnOnce(&mut Vid, &[u8]) -> bool,
    ) -> Result<()> {
        let Some(peb) = self.peb_of(leb) else {
            return Ok(());
        };
        let mut vid = self
            .vid_at(peb)
            .ok_or_else(|| Error::Fault(format!("PEB {peb} lost its VID header")))?;

        let page_size = self.container.page_size() as usize;
        let data_offset = self.container.data_offset() as usize;
        let container = &mut self.container;

        let placed = part.with_scratch(|part, buf| {
            part.peb_read(peb, 0, buf)?;
            if !update(&mut vid, &buf[data_offset..]) {
                return Ok(peb);
            }

            vid.sqnum = container.take_sqnum();
            vid.encode(&mut buf[page_size..data_offset])?;
            container.place(part, peb, buf, Some(vid))
        })?;

        self.lebs[leb as usize] = Some(placed);
        Ok(())
    }

    /// Bring every static block's used-block count up to date, and cut the payload of the last
    /// LEB down to `last_size` bytes if it holds more.
    fn fix_static_headers<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        last_size: Option<u32>,
    ) -> Result<()> {
        if !self.is_static() {
            return Ok(());
        }

        let used_ebs = self.reserved_blocks();
        for leb in 0..used_ebs {
            let truncate = last_size.filter(|_| leb + 1 == used_ebs);
            self.rewrite_header(part, leb, |vid, payload| {
                let mut changed = vid.used_ebs != used_ebs;
                vid.used_ebs = used_ebs;

                if let Some(size) = truncate.filter(|&x| x < vid.data_size) {
                    *vid = vid.static_data(&payload[..size as usize]);
                    changed = true;
                }
                changed
            })?;
        }
        Ok(())
    }

    /// Raise the reservation to `reserved` blocks and persist it
    fn grow<N: Nand>(&mut self, part: &mut Partition<N>, reserved: u32) -> Result<()> {
        let extra = reserved - self.reserved_blocks();
        let available = self.container.available_blocks();
        if extra > available {
            return Err(Error::NoMemory {
                needed: u64::from(extra),
                available: u64::from(available),
            });
        }

        self.record.reserved_pebs = reserved;
        self.lebs.resize(reserved as usize, None);
        self.fix_static_headers(part, None)?;
        self.commit_record(part)
    }

    fn write_leb<N: Nand>(
        &mut self,
        part: &mut Partition<N>,
        leb: u32,
        data: &[u8],
        allow_extend: bool,
    ) -> Result<()> {
        if data.len() > self.leb_size() as usize {
            return Err(Error::BadParameter(format!(
                "{} bytes exceed the {}-byte LEB",
                data.len(),
                self.leb_size()
            )));
        }

        let reserved = self.reserved_blocks();
        if leb > reserved || (leb == reserved && !allow_extend) {
            return Err(Error::out_of_range("LEB", leb, reserved));
        }
        if leb == reserved {
            self.grow(part, reserved + 1)?;
        }

        let peb = match self.peb_of(leb) {
            Some(peb) => peb,
            None => self.container.allocate(part)?,
        };

        let mut vid = Vid {
            vol_type: self.record.vol_type,
            vol_id: self.vol_id,
            lnum: leb,
            data_pad: self.record.data_pad,
            ..Default::default()
        }
        .sqnum(self.container.take_sqnum());
        if self.is_static() {
            vid.used_ebs = self.reserved_blocks();
            vid = vid.static_data(data);
        }

        let peb = self.container.store(part, peb, Some(vid), data)?;
        self.lebs[leb as usize] = Some(peb);
        Ok(())
    }

    fn resize<N: Nand>(&mut self, part: &mut Partition<N>, new_size: u64) -> Result<()> {
        let leb_size = self.leb_size();
        let reserved = lebs_for(new_size, leb_size)?;
        let current = self.reserved_blocks();

        if reserved > current {
            return self.grow(part, reserved);
        }

        if reserved < current {
            for leb in reserved..current {
                if let Some(peb) = self.peb_of(leb) {
                    self.container.release(part, peb)?;
                }
            }
            self.lebs.truncate(reserved as usize);
            self.record.reserved_pebs = reserved;
            self.commit_record(part)?;
        }

        let last_size = match reserved {
            0 => None,
            n => Some((new_size - u64::from(n - 1) * u64::from(leb_size)) as u32),
        };
        self.fix_static_headers(part, last_size)
    }
}

fn list(container: &Container) -> Vec<(u32, String)> {
    container
        .vtbl
        .iter()
        .map(|(id, record)| (id, record.name.clone()))
        .collect()
}

/// I/O on the scanned volume of a partition
pub struct Volume<'a, N: Nand> {
    part: &'a mut Partition<N>,
}

impl<N: Nand> Volume<'_, N> {
    /// Read from the start of `leb`, returning how many bytes were read. The read is clipped to
    /// the LEB size, and for static volumes to the data the block holds.
    pub fn read_at_block(&mut self, leb: u32, buf: &mut [u8]) -> Result<usize> {
        self.part.require(OpenMode::READ)?;
        self.part
            .with_volume_scan(|part, scan| scan.read_leb(part, leb, 0, buf))
    }

    /// Read bytes at a volume offset, across LEBs. If a block fails after some bytes were read,
    /// the count read so far is returned instead of the error: compare it against `buf.len()`.
    pub fn read_at_offset(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.part.require(OpenMode::READ)?;
        self.part
            .with_volume_scan(|part, scan| scan.read_bytes(part, offset, buf))
    }

    /// Replace the contents of `leb`. With `allow_extend`, `leb` may be one past the end of the
    /// reservation, which grows the volume by a block.
    pub fn write_at_block(&mut self, leb: u32, data: &[u8], allow_extend: bool) -> Result<()> {
        self.part.require(OpenMode::WRITE)?;
        self.part
            .with_volume_scan(|part, scan| scan.write_leb(part, leb, data, allow_extend))
    }

    /// Change the reservation to fit `new_size` bytes. Shrinking frees the blocks past the new
    /// end; for static volumes it also cuts the data of the new last block.
    pub fn adjust_size(&mut self, new_size: u64) -> Result<()> {
        self.part.require(OpenMode::WRITE)?;
        self.part
            .with_volume_scan(|part, scan| scan.resize(part, new_size))
    }
}

impl<N: Nand> Partition<N> {
    fn require_unscanned(&self) -> Result<()> {
        match self.state {
            State::Raw => Ok(()),
            _ => Err(Error::NotPermitted(
                "the partition is scanned; unscan it first".into(),
            )),
        }
    }

    /// Run `f` on the scanned volume, with the partition itself free for I/O
    pub(crate) fn with_volume_scan<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut VolumeScan) -> Result<T>,
    ) -> Result<T> {
        let mut scan = match std::mem::replace(&mut self.state, State::Raw) {
            State::Volume(scan) => scan,
            other => {
                self.state = other;
                return Err(Error::NotPermitted("no volume is scanned".into()));
            }
        };

        let result = f(self, &mut scan);
        self.state = State::Volume(scan);
        result
    }

    /// List the volumes of the container spanning the whole partition, as (id, name)
    pub fn discover_volumes(&mut self) -> Result<Vec<(u32, String)>> {
        self.set_overlay(None)?;
        self.list_volumes()
    }

    /// List the volumes of the container at an offset inside the partition
    pub fn discover_volumes_at(&mut self, overlay: Overlay) -> Result<Vec<(u32, String)>> {
        self.set_overlay(Some(overlay))?;
        self.list_volumes()
    }

    fn list_volumes(&mut self) -> Result<Vec<(u32, String)>> {
        self.require(OpenMode::READ | OpenMode::UBI)?;
        let container = Container::attach(self)?;
        Ok(list(&container))
    }

    /// Scan one volume of the container spanning the whole partition. Raw block access is
    /// suspended until [Self::unscan_volume]; a volume already scanned is replaced.
    pub fn scan_volume(&mut self, vol_id: u32) -> Result<()> {
        self.leave_volume();
        self.set_overlay(None)?;
        self.load_volume(vol_id)
    }

    /// Scan one volume of the container at an offset inside the partition
    pub fn scan_volume_at(&mut self, vol_id: u32, overlay: Overlay) -> Result<()> {
        self.leave_volume();
        self.set_overlay(Some(overlay))?;
        self.load_volume(vol_id)
    }

    fn leave_volume(&mut self) {
        if matches!(self.state, State::Volume(_)) {
            self.state = State::Raw;
        }
    }

    fn load_volume(&mut self, vol_id: u32) -> Result<()> {
        self.require(OpenMode::READ | OpenMode::UBI)?;
        let container = Container::attach(self)?;
        let scan = VolumeScan::new(container, vol_id)?;
        self.state = State::Volume(Box::new(scan));
        Ok(())
    }

    /// Forget the scanned volume, returning to raw block access
    pub fn unscan_volume(&mut self) -> Result<()> {
        if !matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted("no volume is scanned".into()));
        }
        self.state = State::Raw;
        Ok(())
    }

    /// The scanned volume, for queries
    pub fn volume_scan(&self) -> Option<&VolumeScan> {
        match &self.state {
            State::Volume(scan) => Some(scan),
            _ => None,
        }
    }

    /// I/O on the scanned volume
    pub fn volume(&mut self) -> Result<Volume<'_, N>> {
        if !matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted("no volume is scanned".into()));
        }
        Ok(Volume { part: self })
    }

    /// Create a volume in the container spanning the whole partition, returning its ID.
    ///
    /// The whole size is reserved at once, keeping back the bad-block reserve and two spare
    /// blocks; only the first LEB is mapped.
    pub fn create_volume(&mut self, volume: &NewVolume) -> Result<u32> {
        self.add_volume(None, volume)
    }

    /// Create a volume in the container at an offset inside the partition
    pub fn create_volume_at(&mut self, overlay: Overlay, volume: &NewVolume) -> Result<u32> {
        self.add_volume(Some(overlay), volume)
    }

    fn add_volume(&mut self, overlay: Option<Overlay>, volume: &NewVolume) -> Result<u32> {
        self.require(OpenMode::RDWR | OpenMode::UBI)?;
        self.require_unscanned()?;
        volume.validate()?;
        self.set_overlay(overlay)?;

        let mut container = Container::attach(self)?;
        let capacity = container.capacity();
        let alignment = u32::from(volume.alignment);
        if alignment > capacity {
            return Err(Error::BadParameter(format!(
                "alignment {alignment} exceeds the {capacity}-byte PEB capacity"
            )));
        }
        let data_pad = capacity % alignment;
        let reserved = lebs_for(volume.size, capacity - data_pad)?;

        let vol_id = match volume.id {
            Some(id) if id as usize >= container.vtbl.len() => {
                return Err(Error::out_of_range(
                    "volume id",
                    id,
                    container.vtbl.len() as u64,
                ))
            }
            Some(id) if container.vtbl.get(id).is_some() => {
                return Err(Error::Duplicate(format!("volume id {id}")))
            }
            Some(id) => id,
            None => container.vtbl.free_id().ok_or(Error::NoMemory {
                needed: 1,
                available: 0,
            })?,
        };
        if let Some(existing) = container.vtbl.find_name(&volume.name) {
            return Err(Error::Duplicate(format!(
                "volume name {:?} (id {existing})",
                volume.name
            )));
        }

        let available = container.available_blocks();
        if reserved > available {
            return Err(Error::NoMemory {
                needed: u64::from(reserved),
                available: u64::from(available),
            });
        }

        let record = VolTableRecord {
            reserved_pebs: reserved,
            alignment,
            data_pad,
            vol_type: volume.vtype,
            upd_marker: false,
            name: volume.name.clone(),
            flags: volume.flags,
        };

        // LEB 0 goes down first: until the table names the volume, attach treats it as free
        if reserved > 0 {
            let peb = container.allocate(self)?;
            let mut vid = Vid {
                vol_type: volume.vtype,
                vol_id,
                data_pad,
                ..Default::default()
            }
            .sqnum(container.take_sqnum());
            if volume.vtype == VolType::Static {
                vid.used_ebs = reserved;
                vid = vid.static_data(&[]);
            }
            container.store(self, peb, Some(vid), &[])?;
        }

        container.vtbl.set(vol_id, record)?;
        container.write_vtbl(self)?;

        info!(
            "created {:?} volume {vol_id} {:?}: {reserved} PEBs",
            volume.vtype, volume.name
        );
        Ok(vol_id)
    }

    /// Delete a volume from the container spanning the whole partition, returning its blocks to
    /// the free pool
    pub fn delete_volume(&mut self, vol_id: u32) -> Result<()> {
        self.remove_volume(vol_id, None)
    }

    /// Delete a volume from the container at an offset inside the partition
    pub fn delete_volume_at(&mut self, vol_id: u32, overlay: Overlay) -> Result<()> {
        self.remove_volume(vol_id, Some(overlay))
    }

    fn remove_volume(&mut self, vol_id: u32, overlay: Option<Overlay>) -> Result<()> {
        self.require(OpenMode::RDWR | OpenMode::UBI)?;
        self.require_unscanned()?;
        self.set_overlay(overlay)?;

        let mut container = Container::attach(self)?;
        let name = match container.vtbl.get(vol_id) {
            Some(record) => record.name.clone(),
            None => return Err(Error::NotFound(vol_id)),
        };

        let pebs: Vec<u32> = container
            .ebt
            .iter()
            .enumerate()
            .filter(|(_, content)| content.vid().is_some_and(|vid| vid.vol_id == vol_id))
            .map(|(peb, _)| peb as u32)
            .collect();
        for &peb in &pebs {
            container.release(self, peb)?;
        }

        container.vtbl.clear(vol_id);
        container.write_vtbl(self)?;

        info!("deleted volume {vol_id} {name:?}, freeing {} PEBs", pebs.len());
        Ok(())
    }
}
