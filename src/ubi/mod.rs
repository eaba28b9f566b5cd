//! This module implements a UBI container manager on top of a [Partition](crate::Partition):
//! formatting, volume table maintenance, and volume creation, deletion, resizing and I/O.
//!
//! Every PEB of a container is laid out the same way:
//!
//! ```text
//! +---------------+---------------+------------------------------------+
//! |  EC header    |  VID header   |  payload ...                       |
//! |  (page 0)     |  (page 1)     |  (from page 2 to the end)          |
//! +---------------+---------------+------------------------------------+
//! ```
//!
//! The EC header is always present once a block has been formatted; the VID header only when the
//! block holds live data for some volume. Two PEBs belong to the internal layout volume and hold
//! identical copies of the volume table.
//!
//! A container normally spans the whole partition, but it may also be placed at a byte offset
//! inside it (see [Overlay]), in which case each PEB straddles two physical blocks.

mod container;
mod format;
pub mod headers;
mod overlay;
mod scan;
mod volume;
mod vtbl;
mod wear;

pub use format::ContainerOptions;
pub use headers::{VolTableRecord, VolType, Vid};
pub use overlay::Overlay;
pub(crate) use overlay::Window;
pub use scan::{scan_blocks, BlockContent, Ebt};
pub use volume::{NewVolume, Volume, VolumeScan};

/// The volume ID of the internal layout volume, which holds the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;

/// Compatibility flags of the layout volume ("reject" if unknown)
pub const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// PEBs taken by the layout volume, one per volume table copy
pub const UBI_LAYOUT_VOLUME_EBS: u32 = 2;

pub const UBI_MAX_VOLUMES: usize = 128;

/// PEBs kept back for bad block handling, per 1024 PEBs of the container
pub const UBI_BEB_LIMIT_PER_1024: u64 = 20;

/// PEBs kept back for wear-leveling
pub const UBI_WL_RESERVED_PEBS: u32 = 1;

/// PEBs kept back for atomic LEB changes
pub const UBI_EBA_RESERVED_PEBS: u32 = 1;
