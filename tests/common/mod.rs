#![allow(dead_code)]

use norfs::{BlockDevice, FileSystem, FsOptions, ADDRESS_START, PAGE_SIZE, SECTORS, SECTOR_SIZE};

/// Error type returned by the simulated flash.
#[derive(Debug)]
pub struct FlashError;

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "simulated flash failure")
    }
}

impl std::error::Error for FlashError {}

/// In-memory NOR flash with real NOR semantics: erase sets a whole sector
/// to 0xFF, programming may only clear bits, and both must be aligned.
/// Write operations can be made to fail after a countdown to emulate power
/// loss mid-sequence.
pub struct RamFlash {
    pub mem: Vec<u8>,
    writes_left: Option<usize>,
}

impl RamFlash {
    pub fn new() -> Self {
        RamFlash {
            mem: vec![0xFF; SECTORS * SECTOR_SIZE],
            writes_left: None,
        }
    }

    pub fn from_mem(mem: Vec<u8>) -> Self {
        assert_eq!(mem.len(), SECTORS * SECTOR_SIZE);
        RamFlash { mem, writes_left: None }
    }

    /// Lets the next `writes` mutating operations succeed and fails every
    /// one after that, freezing the flash contents as a power cut would.
    pub fn fail_after(&mut self, writes: usize) {
        self.writes_left = Some(writes);
    }

    pub fn clear_failure(&mut self) {
        self.writes_left = None;
    }

    fn consume_write(&mut self) -> Result<(), FlashError> {
        match self.writes_left {
            Some(0) => Err(FlashError),
            Some(n) => {
                self.writes_left = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn offset(address: u32) -> usize {
        (address - ADDRESS_START) as usize
    }
}

impl BlockDevice for RamFlash {
    type Error = FlashError;

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.consume_write()?;
        let offset = Self::offset(address);
        assert_eq!(offset % SECTOR_SIZE, 0, "unaligned sector erase");
        self.mem[offset..offset + SECTOR_SIZE].fill(0xFF);
        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.consume_write()?;
        let offset = Self::offset(address);
        assert_eq!(offset % PAGE_SIZE, 0, "unaligned page program");
        assert_eq!(data.len() % PAGE_SIZE, 0, "program length is not page-sized");
        assert!(offset + data.len() <= self.mem.len());
        for (i, &byte) in data.iter().enumerate() {
            let old = self.mem[offset + i];
            assert_eq!(
                old & byte,
                byte,
                "program needs 0->1 transition at 0x{:X} (0x{:02X} -> 0x{:02X})",
                offset + i,
                old,
                byte
            );
            self.mem[offset + i] = old & byte;
        }
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = Self::offset(address);
        buf.copy_from_slice(&self.mem[offset..offset + buf.len()]);
        Ok(())
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Formats and mounts a filesystem over the given flash.
pub fn mounted_fs(flash: &mut RamFlash) -> FileSystem<&mut RamFlash> {
    let fs = FileSystem::new(flash, FsOptions::new());
    fs.format().expect("format");
    fs.mount().expect("mount");
    fs
}

/// Mounts a filesystem over already formatted flash.
pub fn remounted_fs(flash: &mut RamFlash) -> FileSystem<&mut RamFlash> {
    let fs = FileSystem::new(flash, FsOptions::new());
    fs.mount().expect("mount");
    fs
}
