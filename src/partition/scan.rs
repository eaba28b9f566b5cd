//! The logical/physical scanner: builds a table that renumbers the good blocks of a partition
//! densely, skipping the ones marked bad.

use log::debug;

use super::{Partition, State};
use crate::error::{Error, Result};
use crate::nand::Nand;

/// The largest partition (in erase blocks) a logical table may describe
pub const MAX_LEB_TABLE: u32 = 16384;

/// A logical-to-physical block table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LebMap {
    /// One entry per logical block, in increasing physical order
    pebs: Box<[u32]>,

    /// The number of physical blocks the table was built over
    capacity: u32,
}

impl LebMap {
    /// How many logical blocks are mapped
    pub fn mapped(&self) -> u32 {
        self.pebs.len() as u32
    }

    /// The physical block behind logical block `leb`, if any
    pub fn get(&self, leb: u32) -> Option<u32> {
        self.pebs.get(leb as usize).copied()
    }

    /// Iterate over the physical blocks, in logical order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pebs.iter().copied()
    }

    pub(crate) fn resolve(&self, leb: u32) -> Result<u32> {
        match self.get(leb) {
            Some(peb) => Ok(peb),
            None if leb < self.capacity => Err(Error::NotPermitted(format!(
                "logical block {leb} is not mapped ({} good blocks)",
                self.mapped()
            ))),
            None => Err(Error::out_of_range("logical block", leb, self.capacity)),
        }
    }
}

impl<N: Nand> Partition<N> {
    /// Build the logical table from the device's current bad-block state, replacing any
    /// previous one.
    pub fn scan(&mut self) -> Result<()> {
        if matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted(
                "cannot scan blocks while a volume is scanned".into(),
            ));
        }
        if self.physical_blocks() > MAX_LEB_TABLE {
            return Err(Error::out_of_range(
                "partition block count",
                self.physical_blocks(),
                MAX_LEB_TABLE,
            ));
        }

        let mut pebs = Vec::with_capacity(self.physical_blocks() as usize);
        let mut bad = 0;
        for pblock in 0..self.physical_blocks() {
            if self.phys_is_bad(pblock)? {
                debug!("scan: skipping bad block {pblock}");
                bad += 1;
            } else {
                pebs.push(pblock);
            }
        }

        debug!("scan: {} good blocks, {bad} bad", pebs.len());

        self.bad_blocks = bad;
        self.state = State::Logical(LebMap {
            pebs: pebs.into(),
            capacity: self.physical_blocks(),
        });
        Ok(())
    }

    /// Discard the logical table; block indices are physical again
    pub fn unscan(&mut self) -> Result<()> {
        if matches!(self.state, State::Volume(_)) {
            return Err(Error::NotPermitted(
                "a volume is scanned; use unscan_volume".into(),
            ));
        }

        self.state = State::Raw;
        Ok(())
    }

    /// The current logical table, if the partition is scanned
    pub fn leb_map(&self) -> Option<&LebMap> {
        match &self.state {
            State::Logical(map) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::nand::{Nand, NandBlock, NandLayout, SimNand};
    use crate::partition::{OpenMode, Partition};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 64,
    };

    fn nand_with_bad(bad: &[u32]) -> SimNand {
        let mut nand = SimNand::new(TEST_LAYOUT);
        for &index in bad {
            nand.block(index).unwrap().unwrap().mark_bad().unwrap();
        }
        nand
    }

    #[test]
    fn test_scan_skips_bad() -> anyhow::Result<()> {
        let mut part = Partition::open(nand_with_bad(&[0, 5, 6]), OpenMode::READ)?;
        part.scan()?;

        let map = part.leb_map().unwrap();
        assert_eq!(map.mapped(), 13);
        assert_eq!(map.get(0), Some(1));
        assert_eq!(map.get(4), Some(7));
        assert!(map.iter().all(|peb| ![0, 5, 6].contains(&peb)));
        assert_eq!(part.bad_blocks(), 3);
        assert_eq!(part.geometry().logical_blocks, 13);

        // Past the good blocks but within the partition: unmapped
        assert!(matches!(
            part.seek_at_block(13),
            Err(Error::NotPermitted(_))
        ));
        assert!(matches!(
            part.seek_at_block(16),
            Err(Error::OutOfRange { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_scan_idempotent() -> anyhow::Result<()> {
        let mut part = Partition::open(nand_with_bad(&[3, 9]), OpenMode::READ)?;
        part.scan()?;
        let first = part.leb_map().cloned();
        part.unscan()?;
        assert!(part.leb_map().is_none());
        part.scan()?;
        assert_eq!(part.leb_map().cloned(), first);

        Ok(())
    }

    #[test]
    fn test_mark_bad_rescans() -> anyhow::Result<()> {
        let mut part = Partition::open(
            nand_with_bad(&[]),
            OpenMode::RDWR | OpenMode::LOGICAL,
        )?;
        assert_eq!(part.leb_map().unwrap().get(2), Some(2));

        part.mark_bad(2)?;
        let map = part.leb_map().unwrap();
        assert_eq!(map.mapped(), 15);
        assert_eq!(map.get(2), Some(3));

        // Logical addressing follows the new table
        part.write_at_block(2, &[0x33; 64])?;
        let nand = part.close();
        assert_eq!(nand.raw_block(3)?[..64], [0x33; 64]);

        Ok(())
    }
}
