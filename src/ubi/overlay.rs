//! Where a UBI container lives inside a partition.
//!
//! Normally a container spans every physical block of the partition, one PEB per erase block.
//! An [Overlay] instead starts the container at an arbitrary byte offset: each PEB then covers
//! the tail of one physical block and the head of the next, so every access is split at the
//! physical boundary and every store has to merge into (and erase) both physical blocks.

use log::warn;

use super::UBI_LAYOUT_VOLUME_EBS;
use crate::error::{Error, Result};
use crate::nand::{Nand, ERASED_BYTE};
use crate::partition::Partition;

/// A container placed at a byte offset inside the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    base: u64,
    blocks: u32,
}

impl Overlay {
    /// Place a container at byte offset `base`, covering only the two layout blocks
    pub fn new(base: u64) -> Self {
        Self {
            base,
            blocks: UBI_LAYOUT_VOLUME_EBS,
        }
    }

    /// Change how many PEBs the container covers
    pub fn blocks(mut self, blocks: u32) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn block_count(&self) -> u32 {
        self.blocks
    }
}

/// The PEBs a container is addressed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Window {
    /// PEB `n` is physical block `n`
    Blocks(u32),

    /// PEB `n` starts at byte `base + n * erase_size`
    Offset(Overlay),
}

impl Window {
    pub fn peb_count(&self) -> u32 {
        match self {
            Self::Blocks(blocks) => *blocks,
            Self::Offset(overlay) => overlay.blocks,
        }
    }

    pub fn is_offset(&self) -> bool {
        matches!(self, Self::Offset(_))
    }

    /// Make sure the window lies within `blocks` physical blocks of `block_size` bytes
    pub fn check_fits(&self, block_size: u64, blocks: u32) -> Result<()> {
        match self {
            Self::Blocks(n) if *n > blocks => Err(Error::out_of_range("window", *n, blocks)),
            Self::Blocks(_) => Ok(()),
            Self::Offset(overlay) => {
                if overlay.blocks == 0 {
                    return Err(Error::BadParameter("overlay covers no blocks".into()));
                }

                let first = overlay.base / block_size;
                let straddles = overlay.base % block_size != 0;
                let end = first + u64::from(overlay.blocks) + u64::from(straddles);
                if end > u64::from(blocks) {
                    return Err(Error::out_of_range("overlay end block", end, blocks));
                }
                Ok(())
            }
        }
    }
}

/// How much of `contents` needs programming: everything up to the last page that is not erased
fn programmed_len(contents: &[u8], page_size: usize) -> usize {
    contents
        .iter()
        .rposition(|&b| b != ERASED_BYTE)
        .map_or(0, |last| (last + 1).next_multiple_of(page_size))
        .min(contents.len())
}

impl<N: Nand> Partition<N> {
    fn check_peb(&self, peb: u32) -> Result<()> {
        let count = self.window.peb_count();
        if peb >= count {
            return Err(Error::out_of_range("PEB", peb, count));
        }
        Ok(())
    }

    /// Byte position of `offset` within `peb`, relative to the start of the partition
    fn overlay_position(&self, overlay: &Overlay, peb: u32, offset: u32) -> u64 {
        overlay.base + u64::from(peb) * self.block_size() as u64 + u64::from(offset)
    }

    /// Is any physical block under `peb` bad?
    pub(crate) fn peb_is_bad(&mut self, peb: u32) -> Result<bool> {
        self.check_peb(peb)?;
        match self.window {
            Window::Blocks(_) => self.phys_is_bad(peb),
            Window::Offset(overlay) => {
                let block_size = self.block_size() as u64;
                let start = self.overlay_position(&overlay, peb, 0);
                let first = (start / block_size) as u32;
                let last = ((start + block_size - 1) / block_size) as u32;
                for pblock in first..=last {
                    if self.phys_is_bad(pblock)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Read `buf.len()` bytes from `offset` within `peb`
    pub(crate) fn peb_read(&mut self, peb: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_peb(peb)?;
        let overlay = match self.window {
            Window::Blocks(_) => return self.phys_read(peb, offset, buf),
            Window::Offset(overlay) => overlay,
        };

        let block_size = self.block_size() as u64;
        if u64::from(offset) + buf.len() as u64 > block_size {
            return Err(Error::BadParameter(format!(
                "{} bytes at {offset:#x} cross the erase block boundary",
                buf.len()
            )));
        }

        let mut pos = self.overlay_position(&overlay, peb, offset);
        let mut done = 0;
        while done < buf.len() {
            let pblock = (pos / block_size) as u32;
            let inner = pos % block_size;
            let len = (buf.len() - done).min((block_size - inner) as usize);
            self.phys_read(pblock, inner as u32, &mut buf[done..done + len])?;
            done += len;
            pos += len as u64;
        }
        Ok(())
    }

    /// Erase `peb` and program `contents` at its start. Bytes past the end of `contents` are
    /// left erased, and trailing erased pages are not programmed.
    pub(crate) fn peb_store(&mut self, peb: u32, contents: &[u8]) -> Result<()> {
        self.check_peb(peb)?;
        let block_size = self.block_size();
        if contents.len() > block_size {
            return Err(Error::BadParameter(format!(
                "{} bytes do not fit one erase block",
                contents.len()
            )));
        }

        let overlay = match self.window {
            Window::Blocks(_) => {
                self.phys_erase(peb)?;
                let len = programmed_len(contents, self.page_size());
                if len > 0 {
                    self.phys_program(peb, 0, &contents[..len])?;
                }
                return Ok(());
            }
            Window::Offset(overlay) => overlay,
        };

        let start = self.overlay_position(&overlay, peb, 0);
        let first = (start / block_size as u64) as u32;
        let inner = (start % block_size as u64) as usize;

        // (physical block, first byte in it, first byte of `contents`, length)
        let mut pieces = vec![(first, inner, 0, block_size - inner)];
        if inner != 0 {
            pieces.push((first + 1, 0, block_size - inner, inner));
        }

        for (pblock, dst, src, len) in pieces {
            self.with_scratch(|this, buf| {
                this.phys_read(pblock, 0, buf)?;

                let target = &mut buf[dst..dst + len];
                let avail = contents.len().saturating_sub(src).min(len);
                target[..avail].copy_from_slice(&contents[src..src + avail]);
                target[avail..].fill(ERASED_BYTE);

                this.phys_erase(pblock)?;
                let programmed = programmed_len(buf, this.page_size());
                if programmed > 0 {
                    this.phys_program(pblock, 0, &buf[..programmed])?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Take `peb` out of service after an I/O failure. Returns `false` if that is impossible
    /// (an overlay's blocks are fixed), in which case the caller must give up.
    pub(crate) fn peb_retire(&mut self, peb: u32) -> Result<bool> {
        self.check_peb(peb)?;
        match self.window {
            Window::Blocks(_) => {
                self.phys_mark_bad(peb)?;
                Ok(true)
            }
            Window::Offset(_) => {
                warn!("PEB {peb} failed inside an offset overlay; it cannot be replaced");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};
    use crate::partition::OpenMode;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 4,
        bytes_per_page: 64,
    };

    #[test]
    fn test_check_fits() {
        let size = TEST_LAYOUT.block_size() as u64;

        assert!(Window::Blocks(8).check_fits(size, 8).is_ok());
        assert!(Window::Offset(Overlay::new(size * 6)).check_fits(size, 8).is_ok());

        // Unaligned base touches one more physical block
        assert!(matches!(
            Window::Offset(Overlay::new(size * 6 + 100)).check_fits(size, 8),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            Window::Offset(Overlay::new(0).blocks(0)).check_fits(size, 8),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_programmed_len() {
        let mut buf = [ERASED_BYTE; 256];
        assert_eq!(programmed_len(&buf, 64), 0);
        buf[70] = 0;
        assert_eq!(programmed_len(&buf, 64), 128);
        assert_eq!(programmed_len(&buf[..100], 64), 100);
    }

    #[test]
    fn test_offset_store_straddles() -> anyhow::Result<()> {
        let block_size = TEST_LAYOUT.block_size();
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR | OpenMode::UBI)?;

        // Something outside the window that must survive the merge
        part.write_at_block(1, &[0x11; 64])?;

        let base = block_size as u64 + 96;
        part.set_overlay(Some(Overlay::new(base)))?;

        let contents: Vec<u8> = (0..block_size).map(|i| i as u8).collect();
        part.peb_store(0, &contents)?;

        let mut back = vec![0u8; block_size];
        part.peb_read(0, 0, &mut back)?;
        assert_eq!(back, contents);

        // Unaligned read across the physical boundary
        let mut middle = [0u8; 64];
        part.peb_read(0, 128, &mut middle)?;
        assert_eq!(middle[..], contents[128..192]);

        // PEB 1 is untouched and still erased
        part.peb_read(1, 0, &mut back)?;
        assert!(back.iter().all(|&b| b == ERASED_BYTE));

        assert!(!part.peb_retire(0)?);

        part.set_overlay(None)?;
        let nand = part.close();
        assert_eq!(nand.raw_block(1)?[..64], [0x11; 64]);
        assert_eq!(nand.raw_block(1)?[96..], contents[..block_size - 96]);
        assert_eq!(nand.raw_block(2)?[..96], contents[block_size - 96..]);

        Ok(())
    }
}
