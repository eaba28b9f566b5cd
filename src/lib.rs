//! Bad-block-aware access to raw NAND partitions, and a UBI container and volume manager built
//! on top of it.
//!
//! The layers, bottom-up:
//! - [nand]: the device abstraction, with a simulated device for tests and a Linux MTD backend
//! - [partition]: one open partition, addressed physically or through a bad-block-skipping
//!   logical table
//! - [ubi]: the on-flash UBI structures, container formatting and volume management

pub mod error;
pub mod nand;
pub mod partition;
pub mod ubi;

pub use error::{Error, Result};
pub use partition::{get_geometry, Geometry, OpenMode, Partition};
