//! The flash device abstraction: a [Nand] hands out [NandBlock]s, which are read and programmed
//! in whole pages and erased as a unit.
//!
//! Two devices implement it: [SimNand], an in-memory model used by the tests, and (on Linux)
//! [mtd::MtdNand] for real hardware.

use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub mod mtd;

/// What every byte of an erased page reads back as
pub const ERASED_BYTE: u8 = 0xFF;

/// Helpers for byte slices holding page (or header) contents
pub trait PageUtil {
    /// True if every byte is [ERASED_BYTE]
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_BYTE)
    }
}

/// Device geometry: block count, pages per erase block, page size
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes per erase block
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// Bytes on the whole device
    pub fn total_size(&self) -> u64 {
        self.block_size() as u64 * u64::from(self.blocks)
    }
}

/// `BLOCKSxPAGESxBYTES`, e.g. `"1024x64x2048"`
impl FromStr for NandLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |what: &str| Error::BadParameter(format!("layout {s:?}: {what}"));

        let mut fields = s.split('x');
        let mut field = |what: &str| -> Result<u64> {
            fields
                .next()
                .ok_or_else(|| bad("expected BLOCKSxPAGESxBYTES"))?
                .parse()
                .map_err(|_| bad(what))
        };

        let blocks = field("bad block count")?;
        let pages_per_block = field("bad page count")?;
        let bytes_per_page = field("bad page size")?;
        if fields.next().is_some() {
            return Err(bad("trailing fields"));
        }

        Ok(Self {
            blocks: u32::try_from(blocks).map_err(|_| bad("block count too large"))?,
            pages_per_block: u32::try_from(pages_per_block)
                .map_err(|_| bad("page count too large"))?,
            bytes_per_page: usize::try_from(bytes_per_page)
                .map_err(|_| bad("page size too large"))?,
        })
    }
}

/// A flash device, as a list of erase blocks
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Borrow block `index`, or `None` if it is marked bad. Indices past the end are an error.
    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>>;

    fn get_layout(&self) -> NandLayout;
}

/// One good erase block of a [Nand]
pub trait NandBlock {
    fn page_count(&self) -> u32;

    fn page_size(&self) -> usize;

    /// Read whole pages from `start_page` on; `content` is a multiple of the page size
    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<()>;

    /// Program whole pages from `start_page` on.
    ///
    /// Pages must be programmed in ascending order: programming a page also closes every page
    /// before it until the next erase. MLC parts require this, so the simulator enforces it.
    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<()>;

    fn erase(&mut self) -> Result<()>;

    /// Mark the block bad for good. It will not be handed out again.
    fn mark_bad(self) -> Result<()>;
}

/// An in-memory NAND for tests, with injectable erase/program failures
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Bytes of the pages programmed since the last erase; the rest read as erased
    programmed: Vec<u8>,

    pages: u32,
    page_size: usize,
    bad: bool,

    fail_erase: bool,
    fail_program: bool,

    erases: u64,
}

impl SimNand {
    /// A fully erased device with no bad blocks
    pub fn new(layout: NandLayout) -> Self {
        Self {
            blocks: vec![SimBlock::new(layout); layout.blocks as usize].into_boxed_slice(),
            layout,
        }
    }

    /// Replace the whole device contents with an image read from `read`. Clears bad marks.
    pub fn load<R: Read>(&mut self, read: &mut R) -> Result<()> {
        let mut image = vec![0; self.layout.block_size()];

        for mut block in self.blocks.iter_mut() {
            read.read_exact(&mut image)?;
            block.bad = false;
            block.programmed.clear();
            block.program(0, &image)?;
        }

        Ok(())
    }

    /// Dump the device as an image; bad blocks are filled with `0xBD`
    pub fn save<W: Write>(&mut self, write: &mut W) -> Result<()> {
        let mut image = vec![0; self.layout.block_size()];

        for index in 0..self.layout.blocks {
            match self.block(index)? {
                Some(block) => block.read(0, &mut image)?,
                None => image.fill(0xBD),
            }
            write.write_all(&image)?;
        }

        Ok(())
    }

    fn sim_block(&self, index: u32) -> Result<&SimBlock> {
        self.blocks
            .get(index as usize)
            .ok_or_else(|| Error::out_of_range("block", index, self.layout.blocks))
    }

    fn sim_block_mut(&mut self, index: u32) -> Result<&mut SimBlock> {
        let count = self.layout.blocks;
        self.blocks
            .get_mut(index as usize)
            .ok_or_else(|| Error::out_of_range("block", index, count))
    }

    /// Make every later erase of block `index` fail
    pub fn fail_erase(&mut self, index: u32) -> Result<()> {
        self.sim_block_mut(index)?.fail_erase = true;
        Ok(())
    }

    /// Make every later program of block `index` fail
    pub fn fail_program(&mut self, index: u32) -> Result<()> {
        self.sim_block_mut(index)?.fail_program = true;
        Ok(())
    }

    pub fn erase_count(&self, index: u32) -> Result<u64> {
        Ok(self.sim_block(index)?.erases)
    }

    /// The contents of block `index`, bad or not
    pub fn raw_block(&self, index: u32) -> Result<Vec<u8>> {
        let mut contents = self.sim_block(index)?.programmed.clone();
        contents.resize(self.layout.block_size(), ERASED_BYTE);
        Ok(contents)
    }
}

impl SimBlock {
    fn new(layout: NandLayout) -> Self {
        Self {
            programmed: Vec::new(),
            pages: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            bad: false,
            fail_erase: false,
            fail_program: false,
            erases: 0,
        }
    }

    /// Byte offset of `page`, after checking that `content` is exactly one page
    fn page_offset(&self, page: u32, content: &[u8]) -> Result<usize> {
        if content.len() != self.page_size {
            return Err(Error::BadParameter(format!(
                "{} bytes is not a {}-byte page",
                content.len(),
                self.page_size
            )));
        }
        if page >= self.pages {
            return Err(Error::out_of_range("page", page, self.pages));
        }

        Ok(page as usize * self.page_size)
    }

    fn program_page(&mut self, page: u32, content: &[u8]) -> Result<()> {
        let offset = self.page_offset(page, content)?;
        if offset < self.programmed.len() {
            return Err(Error::Io(io::Error::other(format!(
                "page {page} programmed out of order"
            ))));
        }

        // An all-0xFF page leaves the cells untouched
        if !content.is_erased() {
            self.programmed.resize(offset, ERASED_BYTE);
            self.programmed.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, page: u32, content: &mut [u8]) -> Result<()> {
        let offset = self.page_offset(page, content)?;
        let stored = self.programmed.get(offset..).unwrap_or_default();
        let len = stored.len().min(content.len());

        content[..len].copy_from_slice(&stored[..len]);
        content[len..].fill(ERASED_BYTE);
        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>> {
        let count = self.layout.blocks;
        let block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(Error::out_of_range("block", index, count))?;

        Ok((!block.bad).then_some(block))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<()> {
        let page_size = self.page_size;
        for (page, chunk) in (start_page..).zip(content.chunks_mut(page_size)) {
            self.read_page(page, chunk)?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<()> {
        if self.fail_program {
            return Err(Error::Io(io::Error::other("injected program failure")));
        }

        let page_size = self.page_size;
        for (page, chunk) in (start_page..).zip(content.chunks(page_size)) {
            self.program_page(page, chunk)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        if self.fail_erase {
            return Err(Error::Io(io::Error::other("injected erase failure")));
        }

        self.programmed.clear();
        self.erases += 1;
        Ok(())
    }

    fn mark_bad(self) -> Result<()> {
        self.programmed.clear();
        self.bad = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 256,
    };

    #[test]
    fn test_block_lookup() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        assert!(nand.block(TEST_LAYOUT.blocks - 1)?.is_some());
        assert!(matches!(
            nand.block(TEST_LAYOUT.blocks),
            Err(Error::OutOfRange { .. })
        ));

        nand.block(3)?.unwrap().mark_bad()?;
        assert!(nand.block(3)?.is_none());
        assert!(nand.block(4)?.is_some());

        Ok(())
    }

    #[test]
    fn test_program_order() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let page = vec![0x5Au8; TEST_LAYOUT.bytes_per_page];
        let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];

        let mut block = nand.block(0)?.unwrap();
        block.program(4, &page)?;
        // Page 3 was skipped, so it is closed now
        assert!(matches!(block.program(3, &page), Err(Error::Io(_))));
        assert!(block.program(4, &page).is_err());

        block.read(3, &mut out)?;
        assert!(out.is_erased());
        block.read(4, &mut out)?;
        assert_eq!(out, page);

        // Erased content is accepted anywhere and changes nothing
        block.program(6, &[ERASED_BYTE; 256])?;
        block.program(5, &page)?;

        block.erase()?;
        block.program(0, &page)?;
        assert_eq!(nand.erase_count(0)?, 1);

        Ok(())
    }

    #[test]
    fn test_injected_failures() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(1)?;
        nand.fail_program(2)?;
        let page = vec![0u8; TEST_LAYOUT.bytes_per_page];

        assert!(nand.block(1)?.unwrap().erase().is_err());
        nand.block(1)?.unwrap().program(0, &page)?;
        nand.block(2)?.unwrap().erase()?;
        assert!(nand.block(2)?.unwrap().program(0, &page).is_err());

        assert_eq!((nand.erase_count(1)?, nand.erase_count(2)?), (0, 1));

        // Blocks past the end of the device are refused, not indexed
        assert!(matches!(
            nand.fail_program(8),
            Err(Error::OutOfRange { index: 8, limit: 8, .. })
        ));
        assert!(matches!(nand.fail_erase(9), Err(Error::OutOfRange { .. })));
        assert!(matches!(nand.erase_count(8), Err(Error::OutOfRange { .. })));
        assert!(matches!(nand.raw_block(u32::MAX), Err(Error::OutOfRange { .. })));
        Ok(())
    }

    #[test]
    fn test_image_load_save() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.load(&mut io::repeat(0x55))?;
        nand.block(7)?.unwrap().mark_bad()?;

        let mut image = Vec::new();
        nand.save(&mut image)?;

        let block_size = TEST_LAYOUT.block_size();
        assert_eq!(image.len() as u64, TEST_LAYOUT.total_size());
        assert!(image[..7 * block_size].iter().all(|&x| x == 0x55));
        assert!(image[7 * block_size..].iter().all(|&x| x == 0xBD));
        assert_eq!(nand.raw_block(0)?, vec![0x55; block_size]);

        Ok(())
    }

    #[test]
    fn test_layout_from_str() {
        let layout: NandLayout = "1024x64x2048".parse().unwrap();
        assert_eq!(layout.blocks, 1024);
        assert_eq!(layout.block_size(), 128 * 1024);
        assert_eq!(layout.total_size(), 128 * 1024 * 1024);

        for bad in ["64x64", "64xAx2048", "1x2x3x4", ""] {
            assert!(bad.parse::<NandLayout>().is_err(), "{bad:?}");
        }
    }
}
