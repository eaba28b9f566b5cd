//! Block classification: what each PEB of a container currently holds, judged from its two
//! header pages.

use log::debug;

use super::headers::*;
use crate::error::{Error, Result};
use crate::nand::{Nand, PageUtil};
use crate::partition::Partition;

/// What a scan found in one PEB
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockContent {
    /// Marked bad; never touched again
    Bad,

    /// Both header pages erased; no erase counter to carry over
    Erased,

    /// Valid EC header, nothing after it. Ready for a VID header.
    EcErased(Ec),

    /// The block has a UBI EC header and further data. The VID header is `None` when it is
    /// unreadable or when the data is stale, either way the block is free for reuse.
    EcData(Ec, Option<Vid>),

    /// Anything else. Must be erased before use, and its erase counter is lost.
    Garbage,
}

impl BlockContent {
    /// The erase counter, if the block has a valid EC header
    pub fn ec(&self) -> Option<Ec> {
        match self {
            Self::EcErased(ec) | Self::EcData(ec, _) => Some(*ec),
            _ => None,
        }
    }

    /// The VID header, if the block holds live data
    pub fn vid(&self) -> Option<&Vid> {
        match self {
            Self::EcData(_, Some(vid)) => Some(vid),
            _ => None,
        }
    }

    /// Characterize a PEB from its first two pages (EC header, VID header)
    fn classify(pages: &[u8], page_size: usize) -> Self {
        let (ec_page, vid_page) = pages.split_at(page_size);

        let ec = match Ec::decode(ec_page) {
            Ok(ec) => ec,
            Err(Error::Format(_)) if vid_page.is_erased() => return Self::Erased,
            Err(e) => {
                debug!("no usable EC header: {e}");
                return Self::Garbage;
            }
        };

        if vid_page.is_erased() {
            return Self::EcErased(ec);
        }

        match Vid::decode(vid_page) {
            Ok(vid) => Self::EcData(ec, Some(vid)),
            Err(e) => {
                debug!("no usable VID header: {e}");
                Self::EcData(ec, None)
            }
        }
    }
}

/// Erase block table: one [BlockContent] per PEB of the container, indexed by PEB number.
/// Built by [scan_blocks] and then kept in step with every write the container makes.
pub type Ebt = Box<[BlockContent]>;

/// Read the header pages of every PEB in the partition's current window, return the [Ebt]
pub fn scan_blocks<N: Nand>(part: &mut Partition<N>) -> Result<Ebt> {
    let page_size = part.page_size();
    let block_count = part.window.peb_count();
    let progress = howudoin::new()
        .label("Reading UBI headers")
        .set_len(u64::from(block_count));

    let mut headers = vec![0; page_size * 2];
    let ebt = (0..block_count)
        .map(|peb| -> Result<BlockContent> {
            let content = if part.peb_is_bad(peb)? {
                BlockContent::Bad
            } else {
                part.peb_read(peb, 0, &mut headers)?;
                BlockContent::classify(&headers, page_size)
            };
            progress.inc();
            Ok(content)
        })
        .collect::<Result<Ebt>>()?;
    progress.close();

    Ok(ebt)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandBlock, NandLayout, SimNand};
    use crate::partition::OpenMode;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 12,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    fn scan(nand: SimNand) -> anyhow::Result<(Ebt, SimNand)> {
        let mut part = Partition::open(nand, OpenMode::READ | OpenMode::UBI)?;
        let ebt = scan_blocks(&mut part)?;
        Ok((ebt, part.close()))
    }

    #[test]
    fn test_classify_blocks() -> anyhow::Result<()> {
        let (ebt, mut nand) = scan(SimNand::new(LAYOUT))?;
        assert_eq!(ebt.len(), 12);
        assert!(ebt.iter().all(|x| *x == BlockContent::Erased));

        let ec = Ec {
            image_seq: 0x1234,
            ..Ec::default().ec(9)
        };
        let vid = Vid {
            vol_id: 2,
            lnum: 5,
            ..Default::default()
        };
        let page = |fill: &dyn Fn(&mut [u8]) -> anyhow::Result<()>| -> anyhow::Result<Vec<u8>> {
            let mut buf = vec![0xFF; LAYOUT.bytes_per_page];
            fill(&mut buf)?;
            Ok(buf)
        };
        let ec_page = page(&|b| Ok(ec.encode(b)?))?;
        let vid_page = page(&|b| Ok(vid.encode(b)?))?;
        let junk = vec![0x5A; LAYOUT.bytes_per_page];

        nand.block(1)?.unwrap().mark_bad()?;
        nand.block(2)?.unwrap().program(0, &ec_page)?;
        {
            let mut block = nand.block(3)?.unwrap();
            block.program(0, &ec_page)?;
            block.program(1, &vid_page)?;
        }
        {
            let mut block = nand.block(4)?.unwrap();
            block.program(0, &ec_page)?;
            block.program(1, &junk)?;
        }
        nand.block(5)?.unwrap().program(0, &junk)?;
        // VID header without an EC header in front of it
        nand.block(6)?.unwrap().program(1, &vid_page)?;

        let (ebt, _) = scan(nand)?;
        use BlockContent::*;
        assert_eq!(
            ebt[..8],
            [
                Erased,
                Bad,
                EcErased(ec),
                EcData(ec, Some(vid)),
                EcData(ec, None),
                Garbage,
                Garbage,
                Erased
            ]
        );
        assert_eq!(ebt[3].vid().map(|x| x.lnum), Some(5));
        assert_eq!(ebt[4].vid(), None);
        assert_eq!(ebt[2].ec().map(|x| x.ec), Some(9));
        assert_eq!(ebt[5].ec(), None);

        Ok(())
    }
}
