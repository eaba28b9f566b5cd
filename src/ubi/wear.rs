//! Wear-leveling block allocation.
//!
//! Each allocation walks the whole erase block table, so it is linear in the PEB count (and
//! repeated allocation is quadratic). That is fine for partitions of a few thousand blocks.

use log::{debug, warn};

use super::container::Container;
use super::scan::BlockContent;
use crate::error::{Error, Result};
use crate::nand::Nand;
use crate::partition::Partition;

impl Container {
    /// Pick a free, good, non-layout PEB for new data: any fully erased block, otherwise the
    /// one with the lowest erase counter. Blocks found to have gone bad since the scan are
    /// dropped from the pool on the way.
    pub(crate) fn allocate<N: Nand>(&mut self, part: &mut Partition<N>) -> Result<u32> {
        let mut best: Option<(u64, u32)> = None;

        for peb in 0..self.ebt.len() as u32 {
            if !self.is_free(peb) {
                continue;
            }

            if part.peb_is_bad(peb)? {
                warn!("PEB {peb} has gone bad since the scan");
                self.ebt[peb as usize] = BlockContent::Bad;
                continue;
            }

            let ec = match self.ebt[peb as usize] {
                BlockContent::Erased => {
                    debug!("allocating erased PEB {peb}");
                    return Ok(peb);
                }
                content => content.ec().map_or(0, |ec| ec.ec),
            };

            if best.map_or(true, |(lowest, _)| ec < lowest) {
                best = Some((ec, peb));
            }
        }

        let (ec, peb) = best.ok_or(Error::NoMemory {
            needed: 1,
            available: 0,
        })?;
        debug!("allocating PEB {peb} (EC {ec})");
        Ok(peb)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandBlock, NandLayout, SimNand};
    use crate::partition::OpenMode;
    use crate::ubi::ContainerOptions;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    #[test]
    fn test_allocate_lowest_ec() -> anyhow::Result<()> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR | OpenMode::UBI)?;
        part.create_container(&ContainerOptions::new())?;
        let mut container = Container::attach(&mut part)?;

        // Wear blocks 2..6 unevenly; block 5 ends up the least worn
        for (peb, times) in [(2, 3), (3, 2), (4, 4), (5, 1), (6, 2), (7, 5)] {
            for _ in 0..times {
                container.release(&mut part, peb)?;
            }
        }
        assert_eq!(container.allocate(&mut part)?, 5);

        // Layout blocks are never handed out, even when they are the least worn
        assert!(!container.is_free(0));

        // A block that went bad behind our back is skipped and dropped
        let mut nand = part.close();
        nand.block(5)?.unwrap().mark_bad()?;
        let mut part = Partition::open(nand, OpenMode::RDWR | OpenMode::UBI)?;
        assert_eq!(container.allocate(&mut part)?, 3);
        assert_eq!(container.ebt[5], BlockContent::Bad);

        Ok(())
    }

    #[test]
    fn test_allocate_prefers_erased() -> anyhow::Result<()> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR | OpenMode::UBI)?;
        part.create_container(&ContainerOptions::new())?;

        let mut nand = part.close();
        nand.block(6)?.unwrap().erase()?;
        let mut part = Partition::open(nand, OpenMode::RDWR | OpenMode::UBI)?;

        let mut container = Container::attach(&mut part)?;
        assert_eq!(container.ebt[6], BlockContent::Erased);
        assert_eq!(container.allocate(&mut part)?, 6);

        Ok(())
    }

    #[test]
    fn test_allocate_exhausted() -> anyhow::Result<()> {
        let mut part = Partition::open(SimNand::new(TEST_LAYOUT), OpenMode::RDWR | OpenMode::UBI)?;
        part.create_container(&ContainerOptions::new())?;
        let mut container = Container::attach(&mut part)?;

        for peb in 2..8 {
            let vid = container.layout_vid(0);
            container.ebt[peb] = BlockContent::EcData(Default::default(), Some(vid));
        }
        assert!(matches!(
            container.allocate(&mut part),
            Err(Error::NoMemory { .. })
        ));

        Ok(())
    }
}
