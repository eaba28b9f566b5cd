//! This module implements container creation: every good PEB is erased (keeping its erase
//! counter), and the first two that take a write become the layout blocks, each holding an
//! empty volume table.

use log::{debug, info};

use super::container::{common_image_seq, Container};
use super::overlay::Overlay;
use super::scan::{scan_blocks, BlockContent};
use super::UBI_LAYOUT_VOLUME_EBS;
use crate::error::{Error, Result};
use crate::nand::Nand;
use crate::partition::{OpenMode, Partition};

/// Options for [Partition::create_container]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    force: bool,
    image_seq: Option<u32>,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Overwrite an existing UBI container instead of failing with `Busy`
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the image sequence tag written to every EC header.
    ///
    /// The default is the most common tag already on the medium (or 0 if there is none), so
    /// that readers checking the tag keep accepting blocks that were not reformatted.
    pub fn image_seq(mut self, image_seq: u32) -> Self {
        self.image_seq = Some(image_seq);
        self
    }
}

impl<N: Nand> Partition<N> {
    /// Format the whole partition as an empty UBI container
    pub fn create_container(&mut self, opts: &ContainerOptions) -> Result<()> {
        self.set_overlay(None)?;
        self.format_window(opts)
    }

    /// Format an empty UBI container starting at a byte offset inside the partition
    pub fn create_container_at(&mut self, overlay: Overlay, opts: &ContainerOptions) -> Result<()> {
        self.set_overlay(Some(overlay))?;
        self.format_window(opts)
    }

    fn format_window(&mut self, opts: &ContainerOptions) -> Result<()> {
        self.require(OpenMode::RDWR | OpenMode::UBI)?;

        let ebt = scan_blocks(self)?;
        if !opts.force && ebt.iter().any(|x| x.ec().is_some()) {
            return Err(Error::Busy);
        }

        let image_seq = opts
            .image_seq
            .or_else(|| common_image_seq(ebt.iter()))
            .unwrap_or(0);
        let mut container = Container::empty(self, ebt, image_seq)?;
        let vtbl = container.vtbl.encode()?;

        let block_count = container.ebt.len() as u32;
        let rpt = howudoin::new()
            .label("Formatting blocks")
            .set_len(u64::from(block_count));

        let mut layout = 0;
        for peb in 0..block_count {
            rpt.inc();
            if container.ebt[peb as usize] == BlockContent::Bad {
                continue;
            }

            let written = if layout < UBI_LAYOUT_VOLUME_EBS {
                let vid = container.layout_vid(layout);
                container.try_store(self, peb, Some(vid), &vtbl)?
            } else {
                container.try_store(self, peb, None, &[])?
            };

            if !written {
                debug!("PEB {peb} failed and was marked bad");
            } else if layout < UBI_LAYOUT_VOLUME_EBS {
                container.layout[layout as usize] = Some(peb);
                layout += 1;
            }
        }

        rpt.close();

        if layout < UBI_LAYOUT_VOLUME_EBS {
            return Err(Error::NoMemory {
                needed: u64::from(UBI_LAYOUT_VOLUME_EBS),
                available: u64::from(layout),
            });
        }

        info!(
            "created UBI container: {} PEBs, {} bad, layout in {:?}, image_seq {image_seq:#010x}",
            block_count,
            container.bad_blocks(),
            container.layout
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandBlock, NandLayout, SimNand};
    use crate::ubi::headers::{Ec, UBI_EC_HDR_SIZE};
    use crate::ubi::UBI_LAYOUT_VOLUME_ID;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    fn ubi_partition(nand: SimNand) -> anyhow::Result<Partition<SimNand>> {
        Ok(Partition::open(nand, OpenMode::RDWR | OpenMode::UBI)?)
    }

    #[test]
    fn test_format_blank() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.block(0)?.unwrap().mark_bad()?;

        let mut part = ubi_partition(nand)?;
        part.create_container(&ContainerOptions::new().image_seq(0x1234))?;

        // Formatting leaves the partition unscanned
        assert!(part.leb_map().is_none());
        let ebt = scan_blocks(&mut part)?;
        assert_eq!(ebt[0], BlockContent::Bad);

        for (peb, content) in ebt.iter().enumerate().skip(1) {
            let ec = content.ec().unwrap();
            assert_eq!(ec.ec, 0);
            assert_eq!(ec.image_seq, 0x1234);
            assert_eq!(ec.vid_hdr_offset, 128);
            assert_eq!(ec.data_offset, 256);

            match (peb, content.vid()) {
                (1 | 2, Some(vid)) => {
                    assert_eq!(vid.vol_id, UBI_LAYOUT_VOLUME_ID);
                    assert_eq!(vid.lnum, peb as u32 - 1);
                    assert_eq!(vid.sqnum, peb as u64);
                }
                (_, None) => assert!(matches!(content, BlockContent::EcErased(_))),
                x => panic!("unexpected {x:?}"),
            }
        }

        Ok(())
    }

    #[test]
    fn test_format_busy_and_force() -> anyhow::Result<()> {
        let mut part = ubi_partition(SimNand::new(TEST_LAYOUT))?;
        part.create_container(&ContainerOptions::new().image_seq(7))?;

        assert!(matches!(
            part.create_container(&ContainerOptions::new()),
            Err(Error::Busy)
        ));

        // Reformatting keeps the erase counters (incremented) and the image sequence
        part.create_container(&ContainerOptions::new().force(true))?;
        let ebt = scan_blocks(&mut part)?;
        assert!(ebt.iter().all(|x| x.ec().map(|ec| (ec.ec, ec.image_seq)) == Some((1, 7))));

        Ok(())
    }

    #[test]
    fn test_format_relocates_layout() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);

        // An old EC header worth preserving
        let mut page = vec![0u8; 128];
        Ec::default().ec(41).encode(&mut page[..UBI_EC_HDR_SIZE])?;
        nand.block(3)?.unwrap().program(0, &page)?;
        nand.fail_program(1)?;

        let mut part = ubi_partition(nand)?;
        part.create_container(&ContainerOptions::new().force(true))?;
        assert_eq!(part.bad_blocks(), 1);

        let ebt = scan_blocks(&mut part)?;
        assert_eq!(ebt[1], BlockContent::Bad);
        assert_eq!(ebt[2].vid().map(|x| x.lnum), Some(1));
        assert_eq!(ebt[3].ec().map(|x| x.ec), Some(42));
        assert_eq!(ebt[0].vid().map(|x| x.sqnum), Some(1));

        Ok(())
    }

    #[test]
    fn test_format_too_few_blocks() -> anyhow::Result<()> {
        let layout = NandLayout {
            blocks: 2,
            ..TEST_LAYOUT
        };
        let mut nand = SimNand::new(layout);
        nand.fail_erase(1)?;

        let mut part = ubi_partition(nand)?;
        assert!(matches!(
            part.create_container(&ContainerOptions::new()),
            Err(Error::NoMemory {
                needed: 2,
                available: 1
            })
        ));

        Ok(())
    }

    #[test]
    fn test_format_at_offset() -> anyhow::Result<()> {
        let block_size = TEST_LAYOUT.block_size() as u64;
        let mut part = ubi_partition(SimNand::new(TEST_LAYOUT))?;
        part.create_container_at(Overlay::new(3 * block_size + 512), &ContainerOptions::new())?;

        let ebt = scan_blocks(&mut part)?;
        assert_eq!(ebt.len(), 2);
        assert_eq!(ebt[0].vid().map(|x| x.lnum), Some(0));
        assert_eq!(ebt[1].vid().map(|x| x.lnum), Some(1));

        // Nothing outside the overlay was touched
        part.set_overlay(None)?;
        let nand = part.close();
        assert!(nand.raw_block(2)?.iter().all(|&b| b == 0xFF));
        assert!(nand.raw_block(3)?[..512].iter().all(|&b| b == 0xFF));
        assert!(nand.raw_block(6)?.iter().all(|&b| b == 0xFF));

        Ok(())
    }
}
