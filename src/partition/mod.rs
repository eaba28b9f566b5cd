//! The raw block device layer: one open NAND partition, addressed either physically or through
//! a bad-block-skipping logical table.
//!
//! A [Partition] owns its device for as long as it is open. Closing it hands the device back, so
//! a closed descriptor cannot be used by construction. All I/O is synchronous; the partition
//! keeps no background state beyond its scan state and a small arena of erase-block sized
//! scratch buffers.

mod scan;
mod scratch;

pub use scan::{LebMap, MAX_LEB_TABLE};
pub use scratch::SCRATCH_BUFFERS;

use bitflags::bitflags;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::nand::{Nand, NandBlock, NandLayout};
use crate::ubi::{Overlay, VolumeScan, Window};

use scratch::ScratchPool;

bitflags! {
    /// How a partition is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Allow reads
        const READ = 1 << 0;
        /// Allow writes, erases and bad-block marking
        const WRITE = 1 << 1;
        const RDWR = Self::READ.bits() | Self::WRITE.bits();
        /// Scan at open, so that block indices skip bad blocks
        const LOGICAL = 1 << 2;
        /// Only expose one half of the physical blocks (requires `LOGICAL`)
        const HALF = 1 << 3;
        /// With `HALF`, expose the upper half instead of the lower one
        const UPPER = 1 << 4;
        /// The partition holds a UBI container; bad blocks are handled by the UBI layer
        const UBI = 1 << 5;
        /// Mark a block bad when a bare erase or write of it fails
        const MARK_BAD = 1 << 6;
    }
}

impl OpenMode {
    /// Reject combinations of flags that have no meaning
    pub fn validate(self) -> Result<Self> {
        let bad = |why: &str| Err(Error::BadParameter(format!("open mode {self:?}: {why}")));

        if !self.intersects(Self::RDWR) {
            return bad("neither READ nor WRITE");
        }
        if self.contains(Self::HALF) && !self.contains(Self::LOGICAL) {
            return bad("HALF requires LOGICAL");
        }
        if self.contains(Self::UPPER) && !self.contains(Self::HALF) {
            return bad("UPPER requires HALF");
        }
        if self.contains(Self::UBI) && self.intersects(Self::LOGICAL | Self::HALF) {
            return bad("UBI manages bad blocks itself and cannot be LOGICAL");
        }
        if self.contains(Self::MARK_BAD) && !self.contains(Self::WRITE) {
            return bad("MARK_BAD requires WRITE");
        }

        Ok(self)
    }
}

/// The shape of an open partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes covered by the partition (all physical blocks, good or bad)
    pub size: u64,
    /// The smallest programmable unit (NAND page)
    pub write_size: u32,
    /// The smallest erasable unit
    pub erase_size: u32,
    pub physical_blocks: u32,
    /// Blocks addressable through the current table (equal to `physical_blocks` when unscanned)
    pub logical_blocks: u32,
}

impl TryFrom<NandLayout> for Geometry {
    type Error = Error;

    fn try_from(layout: NandLayout) -> Result<Self> {
        if layout.blocks == 0 || layout.pages_per_block == 0 || layout.bytes_per_page == 0 {
            return Err(Error::Unsupported(format!("degenerate NAND layout {layout:?}")));
        }

        let erase_size = u32::try_from(layout.block_size())
            .map_err(|_| Error::Unsupported(format!("erase block too large in {layout:?}")))?;

        Ok(Self {
            size: layout.total_size(),
            write_size: layout.bytes_per_page as u32,
            erase_size,
            physical_blocks: layout.blocks,
            logical_blocks: layout.blocks,
        })
    }
}

/// Read the geometry of a device without opening a partition on it
pub fn get_geometry<N: Nand>(nand: &N) -> Result<Geometry> {
    nand.get_layout().try_into()
}

/// The scan state of a partition. Each state has its own set of valid operations.
#[derive(Debug)]
pub(crate) enum State {
    /// Block indices are physical
    Raw,

    /// Block indices are logical, through the table
    Logical(LebMap),

    /// One UBI volume has been scanned; raw block access is suspended
    Volume(Box<VolumeScan>),
}

/// Where the next `read`/`write` happens: a block index (logical or physical, depending on the
/// scan state) and a byte offset within it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    block: u32,
    offset: u32,
}

/// An open NAND partition
#[derive(Debug)]
pub struct Partition<N: Nand> {
    nand: N,
    mode: OpenMode,
    layout: NandLayout,

    /// The physical blocks this descriptor covers
    first_block: u32,
    blocks: u32,

    pub(crate) state: State,
    pub(crate) window: Window,
    cursor: Cursor,
    bad_blocks: u32,
    scratch: ScratchPool,
}

impl<N: Nand> Partition<N> {
    /// Open a partition on `nand`.
    ///
    /// Fails with `Unsupported` if the geometry is unusable and `BadParameter` if `mode` is an
    /// invalid combination. With `LOGICAL`, the partition is scanned immediately.
    pub fn open(nand: N, mode: OpenMode) -> Result<Self> {
        let mode = mode.validate()?;
        let layout = nand.get_layout();
        let geometry = Geometry::try_from(layout)?;

        let (first_block, blocks) = if mode.contains(OpenMode::HALF) {
            let half = geometry.physical_blocks / 2;
            if half == 0 {
                return Err(Error::Unsupported("too few blocks to split in half".into()));
            }
            match mode.contains(OpenMode::UPPER) {
                true => (half, geometry.physical_blocks - half),
                false => (0, half),
            }
        } else {
            (0, geometry.physical_blocks)
        };

        debug!(
            "opening partition: {blocks} blocks from {first_block}, {} bytes each, mode {mode:?}",
            geometry.erase_size
        );

        let mut partition = Self {
            nand,
            mode,
            layout,
            first_block,
            blocks,
            state: State::Raw,
            window: Window::Blocks(blocks),
            cursor: Cursor::default(),
            bad_blocks: 0,
            scratch: ScratchPool::new(layout.block_size()),
        };

        if mode.contains(OpenMode::LOGICAL) {
            partition.scan()?;
        }

        Ok(partition)
    }

    /// Close the partition, handing back the device
    pub fn close(self) -> N {
        debug_assert_eq!(self.scratch.available(), SCRATCH_BUFFERS);
        self.nand
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn geometry(&self) -> Geometry {
        let logical_blocks = match &self.state {
            State::Logical(map) => map.mapped(),
            _ => self.blocks,
        };

        Geometry {
            size: self.layout.block_size() as u64 * u64::from(self.blocks),
            write_size: self.layout.bytes_per_page as u32,
            erase_size: self.layout.block_size() as u32,
            physical_blocks: self.blocks,
            logical_blocks,
        }
    }

    /// How many bad blocks the last scan (or later marking) has found
    pub fn bad_blocks(&self) -> u32 {
        self.bad_blocks
    }

    pub(crate) fn page_size(&self) -> usize {
        self.layout.bytes_per_page
    }

    pub(crate) fn block_size(&self) -> usize {
        self.layout.block_size()
    }

    pub(crate) fn physical_blocks(&self) -> u32 {
        self.blocks
    }

    pub(crate) fn require(&self, needed: OpenMode) -> Result<()> {
        if self.mode.contains(needed) {
            Ok(())
        } else {
            Err(Error::NotPermitted(format!(
                "partition opened {:?}, operation needs {needed:?}",
                self.mode
            )))
        }
    }

    /// Select where the UBI container lives: the whole partition (`None`), or a window starting
    /// at an arbitrary byte offset.
    pub fn set_overlay(&mut self, overlay: Option<Overlay>) -> Result<()> {
        if !matches!(self.state, State::Raw) {
            return Err(Error::NotPermitted(
                "overlay can only change while unscanned".into(),
            ));
        }

        let window = match overlay {
            None => Window::Blocks(self.blocks),
            Some(overlay) => Window::Offset(overlay),
        };
        window.check_fits(self.block_size() as u64, self.blocks)?;
        self.window = window;
        Ok(())
    }

    /// Run `f` with one scratch buffer taken from this partition's arena, returning the buffer
    /// on every exit path.
    pub(crate) fn with_scratch<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut [u8]) -> Result<T>,
    ) -> Result<T> {
        let mut buf = self.scratch.acquire()?;
        let result = f(self, &mut buf);
        self.scratch.release(buf);
        result
    }

    /// Translate a block index in the current addressing mode to a physical one
    fn resolve(&self, index: u32) -> Result<u32> {
        match &self.state {
            State::Raw if index < self.blocks => Ok(index),
            State::Raw => Err(Error::out_of_range("block", index, self.blocks)),
            State::Logical(map) => map.resolve(index),
            State::Volume(_) => Err(Error::NotPermitted(
                "raw block access while a volume is scanned".into(),
            )),
        }
    }

    fn absolute(&self, pblock: u32) -> Result<u32> {
        if pblock >= self.blocks {
            return Err(Error::out_of_range("physical block", pblock, self.blocks));
        }
        Ok(self.first_block + pblock)
    }

    fn bad_block_error(pblock: u32) -> Error {
        Error::Io(std::io::Error::other(format!("block {pblock} is marked bad")))
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<()> {
        let end = offset as usize + len;
        if end > self.block_size() {
            return Err(Error::BadParameter(format!(
                "{len} bytes at {offset:#x} cross the erase block boundary"
            )));
        }
        Ok(())
    }

    /// Is the physical block (relative to this partition) marked bad?
    pub(crate) fn phys_is_bad(&mut self, pblock: u32) -> Result<bool> {
        let abs = self.absolute(pblock)?;
        Ok(self.nand.block(abs)?.is_none())
    }

    pub(crate) fn phys_mark_bad(&mut self, pblock: u32) -> Result<()> {
        let abs = self.absolute(pblock)?;
        if let Some(block) = self.nand.block(abs)? {
            warn!("marking block {abs} bad");
            block.mark_bad()?;
            self.bad_blocks += 1;
        }
        Ok(())
    }

    pub(crate) fn phys_erase(&mut self, pblock: u32) -> Result<()> {
        let abs = self.absolute(pblock)?;
        let mut block = self.nand.block(abs)?.ok_or_else(|| Self::bad_block_error(abs))?;
        block.erase()
    }

    /// Read `buf.len()` bytes at any byte offset within one physical block
    pub(crate) fn phys_read(&mut self, pblock: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        let abs = self.absolute(pblock)?;
        let page_size = self.page_size();

        if offset as usize % page_size == 0 && buf.len() % page_size == 0 {
            let block = self.nand.block(abs)?.ok_or_else(|| Self::bad_block_error(abs))?;
            return block.read(offset / page_size as u32, buf);
        }

        // Unaligned: read the covering pages, then copy out the requested bytes
        let first_page = offset as usize / page_size;
        let end_page = (offset as usize + buf.len()).div_ceil(page_size);
        let skip = offset as usize - first_page * page_size;

        self.with_scratch(|this, scratch| {
            let pages = &mut scratch[..(end_page - first_page) * page_size];
            let block = this.nand.block(abs)?.ok_or_else(|| Self::bad_block_error(abs))?;
            block.read(first_page as u32, pages)?;
            buf.copy_from_slice(&pages[skip..skip + buf.len()]);
            Ok(())
        })
    }

    /// Program `data` at a page-aligned offset within one physical block, padding the final
    /// page with erased bytes
    pub(crate) fn phys_program(&mut self, pblock: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.check_span(offset, data.len())?;
        let abs = self.absolute(pblock)?;
        let page_size = self.page_size();

        if offset as usize % page_size != 0 {
            return Err(Error::BadParameter(format!(
                "write offset {offset:#x} is not page-aligned"
            )));
        }
        let start_page = offset / page_size as u32;

        if data.len() % page_size == 0 {
            let mut block = self.nand.block(abs)?.ok_or_else(|| Self::bad_block_error(abs))?;
            return block.program(start_page, data);
        }

        self.with_scratch(|this, scratch| {
            let padded = &mut scratch[..data.len().next_multiple_of(page_size)];
            padded[..data.len()].copy_from_slice(data);
            padded[data.len()..].fill(0xFF);

            let mut block = this.nand.block(abs)?.ok_or_else(|| Self::bad_block_error(abs))?;
            block.program(start_page, padded)
        })
    }

    /// On failure of a bare write/erase, mark the block bad if the open mode asks for it
    fn after_failure<T>(&mut self, pblock: u32, result: Result<T>) -> Result<T> {
        if let Err(Error::Io(_)) = &result {
            if self.mode.contains(OpenMode::MARK_BAD) {
                if let Err(e) = self.mark_bad(pblock) {
                    warn!("could not mark block {pblock} bad after failure: {e}");
                }
            }
        }
        result
    }

    /// Is physical block `block` marked bad?
    pub fn check_bad(&mut self, block: u32) -> Result<bool> {
        if matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted(
                "raw block access while a volume is scanned".into(),
            ));
        }
        self.phys_is_bad(block)
    }

    /// Permanently mark physical block `block` bad. If the partition is in logical mode, the
    /// logical table is rebuilt.
    pub fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.require(OpenMode::WRITE)?;
        if matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted(
                "raw block access while a volume is scanned".into(),
            ));
        }

        self.phys_mark_bad(block)?;

        if matches!(self.state, State::Logical(_)) {
            self.scan()?;
        }
        Ok(())
    }

    /// Erase a block. A failure is reported as-is; it is the caller's cue to mark the block bad.
    pub fn erase(&mut self, block: u32) -> Result<()> {
        self.require(OpenMode::WRITE)?;
        let pblock = self.resolve(block)?;
        let result = self.phys_erase(pblock);
        self.after_failure(pblock, result)
    }

    /// Move the cursor to a byte offset, in the current addressing mode
    pub fn seek_at_offset(&mut self, offset: u64) -> Result<()> {
        let block_size = self.block_size() as u64;
        let block = u32::try_from(offset / block_size)
            .map_err(|_| Error::out_of_range("offset", offset, self.geometry().size))?;
        self.resolve(block)?;

        self.cursor = Cursor {
            block,
            offset: (offset % block_size) as u32,
        };
        Ok(())
    }

    /// Move the cursor to the start of a block, in the current addressing mode
    pub fn seek_at_block(&mut self, block: u32) -> Result<()> {
        self.resolve(block)?;
        self.cursor = Cursor { block, offset: 0 };
        Ok(())
    }

    fn advance(&mut self, len: usize) {
        self.cursor.offset += len as u32;
        if self.cursor.offset as usize == self.block_size() {
            self.cursor.block += 1;
            self.cursor.offset = 0;
        }
    }

    /// Read at the cursor, without crossing the end of the current erase block
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.require(OpenMode::READ)?;
        let pblock = self.resolve(self.cursor.block)?;
        self.phys_read(pblock, self.cursor.offset, buf)?;
        self.advance(buf.len());
        Ok(())
    }

    /// Write at the (page-aligned) cursor, without crossing the end of the current erase block
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.require(OpenMode::WRITE)?;
        let pblock = self.resolve(self.cursor.block)?;
        let result = self.phys_program(pblock, self.cursor.offset, data);
        self.after_failure(pblock, result)?;
        self.advance(data.len());
        Ok(())
    }

    pub fn read_at_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        self.seek_at_block(block)?;
        self.read(buf)
    }

    pub fn write_at_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        self.seek_at_block(block)?;
        self.write(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 8,
        bytes_per_page: 128,
    };

    #[test]
    fn test_open_mode_validation() {
        let nand = || SimNand::new(TEST_LAYOUT);

        for mode in [
            OpenMode::empty(),
            OpenMode::MARK_BAD | OpenMode::READ,
            OpenMode::READ | OpenMode::HALF,
            OpenMode::READ | OpenMode::LOGICAL | OpenMode::UPPER,
            OpenMode::RDWR | OpenMode::UBI | OpenMode::LOGICAL,
        ] {
            assert!(matches!(
                Partition::open(nand(), mode),
                Err(Error::BadParameter(_))
            ));
        }

        assert!(Partition::open(nand(), OpenMode::RDWR | OpenMode::UBI).is_ok());
        assert!(Partition::open(nand(), OpenMode::READ | OpenMode::LOGICAL).is_ok());
    }

    #[test]
    fn test_degenerate_geometry() {
        let layout = NandLayout {
            blocks: 0,
            ..TEST_LAYOUT
        };
        assert!(matches!(
            Partition::open(SimNand::new(layout), OpenMode::READ),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_half_partitions() -> anyhow::Result<()> {
        let mode = OpenMode::RDWR | OpenMode::LOGICAL | OpenMode::HALF;

        let lower = Partition::open(SimNand::new(TEST_LAYOUT), mode)?;
        assert_eq!(lower.geometry().physical_blocks, 8);

        let mut upper = Partition::open(SimNand::new(TEST_LAYOUT), mode | OpenMode::UPPER)?;
        upper.write_at_block(0, &[0x42; 128])?;
        let nand = upper.close();
        assert_eq!(nand.raw_block(8)?[..128], [0x42; 128]);
        assert!(nand.raw_block(0)?.iter().all(|&b| b == 0xFF));

        Ok(())
    }

    #[test]
    fn test_read_write_cursor() -> anyhow::Result<()> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR)?;
        let block_size = part.geometry().erase_size as usize;

        part.seek_at_block(3)?;
        part.write(&[1; 128])?;
        part.write(&[2; 100])?; // padded to a page
        part.seek_at_offset(3 * block_size as u64 + 64)?;

        let mut buf = [0u8; 128];
        part.read(&mut buf)?;
        assert_eq!(buf[..64], [1; 64]);
        assert_eq!(buf[64..], [2; 64]);

        // Reading the rest of the block ends the read exactly at the boundary
        let mut rest = vec![0u8; block_size - 192];
        part.read(&mut rest)?;
        assert_eq!(rest[..36], [2; 36]);
        assert!(rest[36..].iter().all(|&b| b == 0xFF));

        // Cursor has moved on to block 4
        let mut next = [0u8; 16];
        part.read(&mut next)?;
        assert_eq!(next, [0xFF; 16]);

        // Reads may not straddle blocks
        part.seek_at_offset(block_size as u64 - 8)?;
        assert!(matches!(
            part.read(&mut [0u8; 16]),
            Err(Error::BadParameter(_))
        ));

        // Writes must start on a page
        part.seek_at_offset(8)?;
        assert!(matches!(part.write(&[0; 8]), Err(Error::BadParameter(_))));

        assert!(matches!(
            part.seek_at_block(16),
            Err(Error::OutOfRange { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_mode_permissions() -> anyhow::Result<()> {
        let mut ro = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::READ)?;
        assert!(matches!(ro.erase(0), Err(Error::NotPermitted(_))));
        assert!(matches!(ro.mark_bad(0), Err(Error::NotPermitted(_))));
        assert!(matches!(
            ro.write_at_block(0, &[0; 128]),
            Err(Error::NotPermitted(_))
        ));

        let mut wo = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::WRITE)?;
        assert!(matches!(
            wo.read_at_block(0, &mut [0; 128]),
            Err(Error::NotPermitted(_))
        ));

        Ok(())
    }

    #[test]
    fn test_mark_bad_on_failure() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(2)?;
        nand.fail_erase(3)?;

        let mut part = Partition::open(nand, OpenMode::RDWR)?;
        assert!(part.erase(2).is_err());
        assert!(!part.check_bad(2)?);

        let nand = part.close();
        let mut part = Partition::open(nand, OpenMode::RDWR | OpenMode::MARK_BAD)?;
        assert!(part.erase(3).is_err());
        assert!(part.check_bad(3)?);
        assert_eq!(part.bad_blocks(), 1);

        Ok(())
    }
}
