//! MTD adapter over the Linux `/dev/mtdX` character devices.

use super::{Mtd, MtdInfo};

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Flash partition backed by an open `/dev/mtdX` file.
#[derive(Debug)]
pub struct MtdDev {
    file: File,
    info: MtdInfo,
}

impl MtdDev {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0").
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let raw = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };

        let info = MtdInfo {
            partition_size: u64::from(raw.size),
            erase_block_size: raw.erasesize,
            write_block_size: raw.writesize as usize,
        };

        Ok(Self { file, info })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`.
    pub fn open_named(name: &str) -> io::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("MTD device {name} could not be found"),
        ))
    }
}

impl Mtd for MtdDev {
    fn info(&self) -> MtdInfo {
        self.info
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn erase(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: offset as u32,
            length: len as u32,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    #[allow(non_camel_case_types)]
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
    #[allow(non_camel_case_types)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}
