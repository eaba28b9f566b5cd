//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandBlock, NandLayout};
use crate::error::{Error, Result};

use log::debug;
use nix::errno::Errno;
use retry::{delay::NoDelay, retry, OperationResult};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Sysfs root for MTD devices
const MTD_SYSFS_ROOT: &str = "/sys/class/mtd";

/// Run an ioctl, restarting it for as long as it is interrupted by a signal
fn restart_on_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> Result<T> {
    retry(NoDelay, || match op() {
        Ok(x) => OperationResult::Ok(x),
        Err(Errno::EINTR) => OperationResult::Retry(Errno::EINTR),
        Err(e) => OperationResult::Err(e),
    })
    .map_err(|e| e.error.into())
}

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = File::options().read(true).write(writable).open(path)?;
        let info = restart_on_eintr(|| unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            Ok(info.assume_init())
        })?;
        let layout = info.try_into()?;
        debug!("opened MTD device with layout {layout:?}");

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by partition number (e.g. 3 for "/dev/mtd3")
    pub fn open_index(index: u32, writable: bool) -> Result<Self> {
        Self::open(format!("/dev/mtd{index}"), writable)
    }

    /// Open the MTD partition called `name`, looking it up in `/proc/mtd`
    pub fn open_named(name: &str, writable: bool) -> Result<Self> {
        let wanted = format!("\"{name}\"");

        // Lines look like: mtd3: 00800000 00020000 "rootfs"
        let table = BufReader::new(File::open("/proc/mtd")?);
        for line in table.lines() {
            let line = line?;
            let Some((dev, rest)) = line.split_once(':') else {
                continue;
            };
            if rest.trim_end().ends_with(&wanted) {
                return Self::open(Path::new("/dev").join(dev), writable);
            }
        }

        Err(Error::Unsupported(format!("no MTD partition named {wanted}")))
    }

    /// Read the layout of partition `index` from sysfs, without opening the device
    pub fn layout_of(index: u32) -> Result<NandLayout> {
        let attr = |name: &str| -> Result<u32> {
            let path = format!("{MTD_SYSFS_ROOT}/mtd{index}/{name}");
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::Unsupported(format!("{path}: {e}")))?;
            text.trim()
                .parse()
                .map_err(|_| Error::Unsupported(format!("{path}: unparsable {text:?}")))
        };

        ioctl::mtd_info_user {
            r#type: 0,
            flags: 0,
            size: attr("size")?,
            erasesize: attr("erasesize")?,
            writesize: attr("writesize")?,
            oobsize: 0,
            padding: 0,
        }
        .try_into()
    }

    /// Device offset of the first byte of block `index`
    fn block_offset(&self, index: u32) -> u64 {
        self.layout.block_size() as u64 * u64::from(index)
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> Result<Option<MtdBlock<'_>>> {
        if index >= self.layout.blocks {
            return Err(Error::out_of_range("block", index, self.layout.blocks));
        }

        let offset = self.block_offset(index);
        let bad = restart_on_eintr(|| unsafe {
            ioctl::memgetbadblock(self.file.as_raw_fd(), &offset)
        })?;

        Ok((bad == 0).then_some(MtdBlock { nand: self, index }))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

/// A good block of an [MtdNand]
pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    fn start(&self) -> u64 {
        self.nand.block_offset(self.index)
    }

    /// Device offset of `start_page`, once `len` bytes from there are known to be whole pages
    /// inside the block
    fn page_offset(&self, start_page: u32, len: usize) -> Result<u64> {
        let page_size = self.page_size();
        if len % page_size != 0 {
            return Err(Error::BadParameter(format!(
                "{len} bytes is not a multiple of the {page_size}-byte page"
            )));
        }

        let end_page = u64::from(start_page) + (len / page_size) as u64;
        if end_page > u64::from(self.page_count()) {
            return Err(Error::out_of_range("page", end_page, self.page_count()));
        }

        Ok(self.start() + u64::from(start_page) * page_size as u64)
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }

    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<()> {
        let offset = self.page_offset(start_page, content.len())?;
        self.nand.file.read_exact_at(content, offset)?;
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<()> {
        let offset = self.page_offset(start_page, content.len())?;
        self.nand.file.write_all_at(content, offset)?;
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        let too_far = |_| Error::Unsupported("MTD erase beyond 4 GiB".into());
        let request = ioctl::erase_info_user {
            start: u32::try_from(self.start()).map_err(too_far)?,
            length: u32::try_from(self.nand.layout.block_size()).map_err(too_far)?,
        };
        restart_on_eintr(|| unsafe { ioctl::memerase(self.nand.file.as_raw_fd(), &request) })?;
        Ok(())
    }

    fn mark_bad(self) -> Result<()> {
        let offset = self.start();
        restart_on_eintr(|| unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &offset)
        })?;
        Ok(())
    }
}

mod ioctl {
    //! MTD character device ioctls (`<mtd/mtd-abi.h>`)

    use super::NandLayout;
    use crate::error::{Error, Result};

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    impl TryFrom<mtd_info_user> for NandLayout {
        type Error = Error;

        fn try_from(info: mtd_info_user) -> Result<Self> {
            // mtdram reports a write size of 1; treat it as 64-byte pages
            let writesize = match info.writesize {
                1 => 64,
                x => x,
            };

            if info.erasesize == 0 || info.size % info.erasesize != 0 {
                return Err(Error::Unsupported(format!(
                    "MTD size {:#x} is not a multiple of the erase size {:#x}",
                    info.size, info.erasesize
                )));
            }
            if writesize == 0 || info.erasesize % writesize != 0 {
                return Err(Error::Unsupported(format!(
                    "MTD erase size {:#x} is not a multiple of the write size {writesize:#x}",
                    info.erasesize
                )));
            }

            Ok(NandLayout {
                blocks: info.size / info.erasesize,
                pages_per_block: info.erasesize / writesize,
                bytes_per_page: writesize as usize,
            })
        }
    }
}
