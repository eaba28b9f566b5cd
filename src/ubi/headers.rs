//! On-flash UBI structures: the EC header, the VID header and the volume table record.
//!
//! The raw layouts (big-endian, CRC last) are taken from `income`. The types here are the
//! trimmed-down views the rest of the crate works with; converting one into its raw form seals it
//! with the right magic, version and CRC.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use log::warn;

use crate::error::{Error, Result};
use crate::nand::PageUtil;

/// UBI's CRC32: seed `0xFFFFFFFF`, no final inversion
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
pub const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// Erase counters stop counting here
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// The longest volume name, in bytes
pub const UBI_VOL_NAME_MAX: usize = 127;

/// Volume flag: grow the volume to fill the container on first attach
pub const UBI_VTBL_AUTORESIZE_FLG: u8 = 0x01;
/// Volume flag: skip the data CRC check of static volumes
pub const UBI_VTBL_SKIP_CRC_CHECK_FLG: u8 = 0x02;

fn magic<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Unsupported("UBI magic has unexpected length".into()))
}

fn serialize<T: DekuContainerWrite>(what: &str, raw: &T) -> Result<Vec<u8>> {
    raw.to_bytes()
        .map_err(|e| Error::Fault(format!("serializing {what}: {e}")))
}

/// A raw structure whose final field is a CRC32 over everything before it
pub trait ComputeCrc: Sized + DekuContainerWrite {
    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);

    fn compute_crc(&self) -> Result<u32> {
        let bytes = serialize("CRC-covered structure", self)?;
        let covered = bytes.len().saturating_sub(std::mem::size_of::<u32>());
        Ok(UBI_CRC.checksum(&bytes[..covered]))
    }

    fn check_crc(&self) -> Result<bool> {
        Ok(self.get_crc() == self.compute_crc()?)
    }

    fn fix_crc(&mut self) -> Result<()> {
        let crc = self.compute_crc()?;
        self.set_crc(crc);
        Ok(())
    }
}

macro_rules! crc_field {
    ($raw:ty, $field:ident) => {
        impl ComputeCrc for $raw {
            fn get_crc(&self) -> u32 {
                self.$field
            }
            fn set_crc(&mut self, crc: u32) {
                self.$field = crc;
            }
        }
    };
}

crc_field!(EcHdr, hdr_crc);
crc_field!(VidHdr, hdr_crc);
crc_field!(VtblRecord, crc);

/// A header that occupies the start of a page: parsing rejects an erased region, then checks
/// magic, version and CRC in that order
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    const NAME: &'static str;
    const SIZE: usize;
    const MAGIC: &'static [u8];

    fn magic_of(&self) -> &[u8];
    fn version_of(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Self> {
        let Some(region) = buf.get(..Self::SIZE) else {
            return Err(Error::BadParameter(format!(
                "{} needs {} bytes, got {}",
                Self::NAME,
                Self::SIZE,
                buf.len()
            )));
        };

        if region.is_erased() {
            return Err(Error::Format(format!("{} not yet written", Self::NAME)));
        }

        let (_, header) = Self::from_bytes((region, 0))
            .map_err(|e| Error::Fault(format!("{}: {e}", Self::NAME)))?;

        if header.magic_of() != Self::MAGIC {
            return Err(Error::Fault(format!("{}: bad magic", Self::NAME)));
        }
        let version = header.version_of();
        if version != UBI_VERSION {
            return Err(Error::Unsupported(format!(
                "{}: UBI version {version}",
                Self::NAME
            )));
        }
        if !header.check_crc()? {
            return Err(Error::Fault(format!("{}: CRC mismatch", Self::NAME)));
        }

        Ok(header)
    }
}

macro_rules! page_header {
    ($raw:ty, $name:literal, $size:expr, $magic:expr) => {
        impl ParseHeader<'_> for $raw {
            const NAME: &'static str = $name;
            const SIZE: usize = $size;
            const MAGIC: &'static [u8] = $magic;

            fn magic_of(&self) -> &[u8] {
                &self.magic
            }
            fn version_of(&self) -> u8 {
                self.version
            }
        }
    };
}

page_header!(EcHdr, "EC header", UBI_EC_HDR_SIZE, UBI_EC_HDR_MAGIC);
page_header!(VidHdr, "VID header", UBI_VID_HDR_SIZE, UBI_VID_HDR_MAGIC);

/// Copy a sealed header to the front of `out`
fn store_header<T: DekuContainerWrite>(what: &str, raw: &T, out: &mut [u8]) -> Result<()> {
    let bytes = serialize(what, raw)?;
    let len = bytes.len();
    let Some(dest) = out.get_mut(..len) else {
        return Err(Error::BadParameter(format!(
            "{what} needs {len} bytes of buffer, got {}",
            out.len()
        )));
    };
    dest.copy_from_slice(&bytes);
    Ok(())
}

/// Erase counter header, found in page 0 of every formatted PEB
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// One more erase, saturating at [UBI_MAX_ERASECOUNTER]
    pub fn inc_ec(mut self) -> Self {
        if self.ec >= UBI_MAX_ERASECOUNTER {
            warn!("erase counter saturated at {UBI_MAX_ERASECOUNTER}");
            self.ec = UBI_MAX_ERASECOUNTER;
        } else {
            self.ec += 1;
        }
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        EcHdr::parse(bytes).map(Self::from)
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        store_header("EC header", &EcHdr::try_from(self)?, out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(raw: EcHdr) -> Self {
        Self {
            ec: raw.ec,
            vid_hdr_offset: raw.vid_hdr_offset,
            data_offset: raw.data_offset,
            image_seq: raw.image_seq,
        }
    }
}

impl TryFrom<Ec> for EcHdr {
    type Error = Error;

    fn try_from(ec: Ec) -> Result<EcHdr> {
        let mut raw = EcHdr {
            magic: magic(UBI_EC_HDR_MAGIC)?,
            version: UBI_VERSION,
            padding1: Default::default(),
            ec: ec.ec,
            vid_hdr_offset: ec.vid_hdr_offset,
            data_offset: ec.data_offset,
            image_seq: ec.image_seq,
            padding2: Default::default(),
            hdr_crc: 0,
        };
        raw.fix_crc()?;
        Ok(raw)
    }
}

/// Volume type, as stored in VID headers and volume table records
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// Random-access read/write
    #[default]
    Dynamic,

    /// Fixed contents: every LEB records its payload size and CRC
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(Error::Fault(format!("unknown volume type {x}"))),
        }
    }
}

/// Volume identifier header, found in page 1 of every PEB that holds a LEB
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,

    /// Set when the PEB was filled by copying another one
    pub copy_flag: bool,

    /// Handling flags for internal volumes; 0 for user volumes
    pub compat: u8,

    pub vol_id: u32,

    /// Logical block number inside the volume
    pub lnum: u32,

    /// Static volumes: payload bytes held by this LEB. 0 for dynamic volumes.
    pub data_size: u32,

    /// Static volumes: LEB count of the whole volume. 0 for dynamic volumes.
    pub used_ebs: u32,

    /// Bytes left unused at the end of the PEB so the LEB size is a multiple of the alignment
    pub data_pad: u32,

    /// CRC over the first `data_size` payload bytes
    pub data_crc: u32,

    /// Global write counter; the higher value wins when two PEBs claim the same LEB
    pub sqnum: u64,
}

impl Vid {
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Record `payload` as the static data of this LEB (size and CRC)
    pub fn static_data(mut self, payload: &[u8]) -> Self {
        self.data_size = payload.len() as u32;
        self.data_crc = UBI_CRC.checksum(payload);
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        VidHdr::parse(bytes).and_then(Self::try_from)
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        store_header("VID header", &VidHdr::try_from(self)?, out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = Error;

    fn try_from(raw: VidHdr) -> Result<Self> {
        Ok(Self {
            vol_type: raw.vol_type.try_into()?,
            copy_flag: raw.copy_flag != 0,
            compat: raw.compat,
            vol_id: raw.vol_id,
            lnum: raw.lnum,
            data_size: raw.data_size,
            used_ebs: raw.used_ebs,
            data_pad: raw.data_pad,
            data_crc: raw.data_crc,
            sqnum: raw.sqnum,
        })
    }
}

impl TryFrom<Vid> for VidHdr {
    type Error = Error;

    fn try_from(vid: Vid) -> Result<VidHdr> {
        let mut raw = VidHdr {
            magic: magic(UBI_VID_HDR_MAGIC)?,
            version: UBI_VERSION,
            vol_type: vid.vol_type.into(),
            copy_flag: vid.copy_flag.into(),
            compat: vid.compat,
            vol_id: vid.vol_id,
            lnum: vid.lnum,
            padding1: Default::default(),
            data_size: vid.data_size,
            used_ebs: vid.used_ebs,
            data_pad: vid.data_pad,
            data_crc: vid.data_crc,
            padding2: Default::default(),
            sqnum: vid.sqnum,
            padding3: Default::default(),
            hdr_crc: 0,
        };
        raw.fix_crc()?;
        Ok(raw)
    }
}

/// One slot of the volume table
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// PEBs reserved for the volume
    pub reserved_pebs: u32,

    /// LEB sizes of the volume are a multiple of this
    pub alignment: u32,

    /// Bytes cut from the end of each PEB to honor `alignment`
    pub data_pad: u32,

    pub vol_type: VolType,

    /// Set while a whole-volume update is in progress
    pub upd_marker: bool,

    /// UTF-8, at most [UBI_VOL_NAME_MAX] bytes
    pub name: String,

    pub flags: u8,
}

impl VolTableRecord {
    /// Decode one record. An all-zero slot (with a valid CRC) is an unused entry and decodes to
    /// `None`.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let (_, raw) = VtblRecord::from_bytes((bytes, 0))
            .map_err(|e| Error::Fault(format!("volume table record: {e}")))?;
        if !raw.check_crc()? {
            return Err(Error::Fault("volume table record: CRC mismatch".into()));
        }
        if raw.vol_type == 0 && raw.reserved_pebs == 0 {
            return Ok(None);
        }
        Self::try_from(raw).map(Some)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize("volume table record", &VtblRecord::try_from(self.clone())?)
    }

    /// The bytes of an unused slot
    pub fn none_to_bytes() -> Result<Vec<u8>> {
        let mut raw = VtblRecord {
            reserved_pebs: 0,
            alignment: 0,
            data_pad: 0,
            vol_type: 0,
            upd_marker: 0,
            name_len: 0,
            name: std::array::from_fn(|_| 0),
            flags: 0,
            padding: Default::default(),
            crc: 0,
        };
        raw.fix_crc()?;
        serialize("volume table record", &raw)
    }
}

/// Serialization of a possibly-unused volume table slot
pub trait OptionToBytes {
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

impl OptionToBytes for Option<VolTableRecord> {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        self.as_ref()
            .map_or_else(VolTableRecord::none_to_bytes, VolTableRecord::to_bytes)
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = Error;

    fn try_from(raw: VtblRecord) -> Result<Self> {
        let len = raw.name_len as usize;
        let name = raw
            .name
            .get(..len)
            .filter(|_| len <= UBI_VOL_NAME_MAX)
            .ok_or_else(|| Error::Fault(format!("volume name length {len}")))?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| Error::Fault("volume name is not UTF-8".into()))?;

        Ok(Self {
            reserved_pebs: raw.reserved_pebs,
            alignment: raw.alignment,
            data_pad: raw.data_pad,
            vol_type: raw.vol_type.try_into()?,
            upd_marker: raw.upd_marker != 0,
            name,
            flags: raw.flags,
        })
    }
}

impl TryFrom<VolTableRecord> for VtblRecord {
    type Error = Error;

    fn try_from(record: VolTableRecord) -> Result<VtblRecord> {
        let bytes = record.name.as_bytes();
        if bytes.len() > UBI_VOL_NAME_MAX {
            return Err(Error::BadParameter(format!(
                "volume name {:?} longer than {UBI_VOL_NAME_MAX} bytes",
                record.name
            )));
        }

        let mut raw = VtblRecord {
            reserved_pebs: record.reserved_pebs,
            alignment: record.alignment,
            data_pad: record.data_pad,
            vol_type: record.vol_type.into(),
            upd_marker: record.upd_marker.into(),
            name_len: bytes.len() as _,
            name: std::array::from_fn(|_| 0),
            flags: record.flags,
            padding: Default::default(),
            crc: 0,
        };
        raw.name[..bytes.len()].copy_from_slice(bytes);
        raw.fix_crc()?;
        Ok(raw)
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default();
    let vid = Vid::default();
    let vtbl = VolTableRecord {
        alignment: 1024,
        name: "example".to_string(),
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf)?, ec);

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf)?, vid);

    let vec = vtbl.to_bytes()?;
    assert_eq!(vec.len(), UBI_VTBL_RECORD_SIZE);
    assert_eq!(VolTableRecord::decode(&vec)?, Some(vtbl));

    Ok(())
}

#[test]
fn test_big_endian_layout() -> anyhow::Result<()> {
    let ec = Ec {
        ec: 0x0102_0304_0506_0708,
        vid_hdr_offset: 0x800,
        data_offset: 0x1000,
        image_seq: 0xA1B2_C3D4,
    };
    let mut buf = vec![0xFFu8; UBI_EC_HDR_SIZE];
    ec.encode(&mut buf)?;

    assert_eq!(&buf[..4], b"UBI#");
    assert_eq!(buf[4], UBI_VERSION);
    assert_eq!(buf[8..16], [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(buf[16..20], [0, 0, 0x08, 0]);
    assert_eq!(buf[20..24], [0, 0, 0x10, 0]);
    assert_eq!(buf[24..28], [0xA1, 0xB2, 0xC3, 0xD4]);

    let crc = UBI_CRC.checksum(&buf[..UBI_EC_HDR_SIZE - 4]);
    assert_eq!(buf[UBI_EC_HDR_SIZE - 4..], crc.to_be_bytes());

    Ok(())
}

#[test]
fn test_decode_errors() -> anyhow::Result<()> {
    let erased = [0xFFu8; UBI_EC_HDR_SIZE];
    assert!(matches!(Ec::decode(&erased), Err(Error::Format(_))));

    let mut buf = [0xFFu8; UBI_VID_HDR_SIZE];
    Vid {
        vol_id: 3,
        lnum: 7,
        ..Default::default()
    }
    .encode(&mut buf)?;

    // An EC parse of a VID header fails on magic
    assert!(matches!(Ec::decode(&buf), Err(Error::Fault(_))));

    let mut corrupt = buf;
    corrupt[12] ^= 0x01;
    assert!(matches!(Vid::decode(&corrupt), Err(Error::Fault(_))));

    let mut future = buf;
    future[4] = UBI_VERSION + 1;
    assert!(matches!(Vid::decode(&future), Err(Error::Unsupported(_))));

    Ok(())
}

#[test]
fn test_empty_record() -> anyhow::Result<()> {
    let empty = VolTableRecord::none_to_bytes()?;
    assert_eq!(VolTableRecord::decode(&empty)?, None);
    assert_eq!(None::<VolTableRecord>.to_bytes()?, empty);

    let mut corrupt = empty.clone();
    corrupt[0] = 1;
    assert!(matches!(
        VolTableRecord::decode(&corrupt),
        Err(Error::Fault(_))
    ));

    let long = VolTableRecord {
        name: "x".repeat(UBI_VOL_NAME_MAX + 1),
        vol_type: VolType::Dynamic,
        ..Default::default()
    };
    assert!(matches!(long.to_bytes(), Err(Error::BadParameter(_))));

    Ok(())
}

#[test]
fn test_inc_ec_saturates() {
    let ec = Ec::default().ec(UBI_MAX_ERASECOUNTER);
    assert_eq!(ec.inc_ec().ec, UBI_MAX_ERASECOUNTER);
    assert_eq!(Ec::default().inc_ec().ec, 1);
}
