//! The volume table: the payload of both layout-volume blocks, one record per volume id.

use super::headers::{OptionToBytes, VolTableRecord, UBI_VTBL_RECORD_SIZE};
use super::UBI_MAX_VOLUMES;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTable {
    records: Vec<Option<VolTableRecord>>,
}

impl VolumeTable {
    /// How many records fit a layout block with `leb_size` usable bytes
    pub fn record_count(leb_size: u32) -> usize {
        std::cmp::min(leb_size as usize / UBI_VTBL_RECORD_SIZE, UBI_MAX_VOLUMES)
    }

    /// An empty table for layout blocks with `leb_size` usable bytes
    pub fn new(leb_size: u32) -> Result<Self> {
        let count = Self::record_count(leb_size);
        if count == 0 {
            return Err(Error::Unsupported(format!(
                "{leb_size}-byte LEBs cannot hold a volume table"
            )));
        }

        Ok(Self {
            records: vec![None; count],
        })
    }

    /// Parse a table from layout block payload. Every record must be CRC-valid.
    pub fn decode(bytes: &[u8], leb_size: u32) -> Result<Self> {
        let mut table = Self::new(leb_size)?;
        let needed = table.records.len() * UBI_VTBL_RECORD_SIZE;
        let bytes = bytes.get(..needed).ok_or_else(|| {
            Error::Fault(format!("volume table needs {needed} bytes, got {}", bytes.len()))
        })?;

        for (slot, chunk) in table
            .records
            .iter_mut()
            .zip(bytes.chunks_exact(UBI_VTBL_RECORD_SIZE))
        {
            *slot = VolTableRecord::decode(chunk)?;
        }

        Ok(table)
    }

    /// The layout block payload for this table
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.byte_len());
        for record in &self.records {
            data.extend(record.to_bytes()?);
        }
        Ok(data)
    }

    pub fn byte_len(&self) -> usize {
        self.records.len() * UBI_VTBL_RECORD_SIZE
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: u32) -> Option<&VolTableRecord> {
        self.records.get(id as usize).and_then(Option::as_ref)
    }

    pub fn set(&mut self, id: u32, record: VolTableRecord) -> Result<()> {
        let count = self.records.len() as u32;
        let slot = self
            .records
            .get_mut(id as usize)
            .ok_or(Error::out_of_range("volume id", id, count))?;
        *slot = Some(record);
        Ok(())
    }

    pub fn clear(&mut self, id: u32) -> Option<VolTableRecord> {
        self.records.get_mut(id as usize).and_then(Option::take)
    }

    /// The first unused volume id
    pub fn free_id(&self) -> Option<u32> {
        self.records.iter().position(Option::is_none).map(|x| x as u32)
    }

    pub fn find_name(&self, name: &str) -> Option<u32> {
        self.iter()
            .find(|(_, record)| record.name == name)
            .map(|(id, _)| id)
    }

    /// Iterate over the populated records
    pub fn iter(&self) -> impl Iterator<Item = (u32, &VolTableRecord)> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(id, record)| record.as_ref().map(|r| (id as u32, r)))
    }
}

#[test]
fn test_volume_table() -> anyhow::Result<()> {
    use super::VolType;

    assert_eq!(VolumeTable::record_count(1792), 10);
    assert_eq!(VolumeTable::record_count(126976), UBI_MAX_VOLUMES);
    assert!(matches!(VolumeTable::new(100), Err(Error::Unsupported(_))));

    let mut table = VolumeTable::new(1792)?;
    assert_eq!(table.free_id(), Some(0));
    table.set(
        3,
        VolTableRecord {
            reserved_pebs: 4,
            alignment: 1,
            vol_type: VolType::Static,
            name: "rootfs".into(),
            ..Default::default()
        },
    )?;
    assert!(table.set(10, Default::default()).is_err());

    let bytes = table.encode()?;
    assert_eq!(bytes.len(), 10 * UBI_VTBL_RECORD_SIZE);

    let decoded = VolumeTable::decode(&bytes, 1792)?;
    assert_eq!(decoded, table);
    assert_eq!(decoded.find_name("rootfs"), Some(3));
    assert_eq!(decoded.iter().count(), 1);

    let mut corrupt = bytes.clone();
    corrupt[3 * UBI_VTBL_RECORD_SIZE + 20] ^= 0xFF;
    assert!(matches!(
        VolumeTable::decode(&corrupt, 1792),
        Err(Error::Fault(_))
    ));

    table.clear(3);
    assert_eq!(table, VolumeTable::new(1792)?);

    Ok(())
}
