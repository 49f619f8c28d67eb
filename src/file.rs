use core::cmp;

use bitflags::bitflags;
use log::debug;

use crate::config::{PAGE_SIZE, SECTOR_SIZE, TABLE_COUNT};
use crate::crc::{self, CRC_INIT};
use crate::device::BlockDevice;
use crate::error::Error;
use crate::fs::{retire_chain, sector_address, FileSystem};
use crate::table::{SectorFlags, NEXT_EOF};

bitflags! {
    /// File open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        /// Open an existing file for sequential reading.
        const READ = 0x01;
        /// Open for append-only writing, creating or replacing the file.
        const WRITE = 0x02;
        /// Read directly into the caller's buffer instead of going through
        /// the filesystem scratch buffer.
        const ZERO_COPY = 0x04;
    }
}

/// Fixed length of a file name slot, including the NUL terminator.
pub(crate) const NAME_SIZE: usize = 32;

/// Serialized size of a file header on flash.
pub(crate) const HEADER_SIZE: usize = NAME_SIZE + 12;

const _: () = assert!(HEADER_SIZE <= PAGE_SIZE);

/// File header stored in the first page of a file's start sector:
/// NUL-terminated name, content length, close timestamp and the running
/// CRC of the content. The rest of the page stays erased.
#[derive(Clone, Debug)]
pub(crate) struct FileHeader {
    name: [u8; NAME_SIZE],
    len: u32,
    timestamp: u32,
    crc: u32,
}

impl FileHeader {
    pub(crate) fn new(name: &[u8]) -> Self {
        debug_assert!(!name.is_empty() && name.len() < NAME_SIZE);
        let mut header = FileHeader {
            name: [0; NAME_SIZE],
            len: 0,
            timestamp: 0,
            crc: CRC_INIT,
        };
        header.name[..name.len()].copy_from_slice(name);
        header
    }

    pub(crate) fn deserialize(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= HEADER_SIZE);
        let mut name = [0; NAME_SIZE];
        name.copy_from_slice(&raw[..NAME_SIZE]);
        let word = |offset: usize| {
            u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
        };
        FileHeader {
            name,
            len: word(NAME_SIZE),
            timestamp: word(NAME_SIZE + 4),
            crc: word(NAME_SIZE + 8),
        }
    }

    pub(crate) fn serialize_into(&self, out: &mut [u8]) {
        out[..NAME_SIZE].copy_from_slice(&self.name);
        out[NAME_SIZE..NAME_SIZE + 4].copy_from_slice(&self.len.to_le_bytes());
        out[NAME_SIZE + 4..NAME_SIZE + 8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[NAME_SIZE + 8..NAME_SIZE + 12].copy_from_slice(&self.crc.to_le_bytes());
    }

    pub(crate) fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &self.name[..len]
    }

    pub(crate) fn name_str(&self) -> &str {
        core::str::from_utf8(self.name_bytes()).unwrap_or("?")
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub(crate) fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub(crate) fn update_crc(&mut self, data: &[u8]) {
        crc::crc32(data, &mut self.crc);
    }

    pub(crate) fn reset_crc(&mut self) {
        self.crc = CRC_INIT;
    }
}

/// An open file.
///
/// Obtained from `FileSystem::open_file`. Writes stage a new chain of
/// sectors that becomes the visible version of the file only when `close`
/// commits it; until then any previous version stays intact on flash.
/// Dropping a handle without closing it publishes nothing.
pub struct File<'a, D: BlockDevice> {
    fs: &'a FileSystem<D>,
    header: FileHeader,
    flags: OpenFlags,
    start_sector: Option<usize>,
    current_sector: Option<usize>,
    old_file_sector: Option<usize>,
    rw_pos_in_sector: usize,
    position: u32,
    failed: bool,
}

impl<'a, D: BlockDevice> File<'a, D> {
    pub(crate) fn open_read(
        fs: &'a FileSystem<D>,
        header: FileHeader,
        sector: usize,
        flags: OpenFlags,
    ) -> Self {
        File {
            fs,
            header,
            flags,
            start_sector: Some(sector),
            current_sector: Some(sector),
            old_file_sector: None,
            // The first page of the start sector is the header.
            rw_pos_in_sector: PAGE_SIZE,
            position: 0,
            failed: false,
        }
    }

    pub(crate) fn open_write(
        fs: &'a FileSystem<D>,
        header: FileHeader,
        old_file_sector: Option<usize>,
        flags: OpenFlags,
    ) -> Self {
        File {
            fs,
            header,
            flags,
            start_sector: None,
            current_sector: None,
            old_file_sector,
            rw_pos_in_sector: 0,
            position: 0,
            failed: false,
        }
    }

    /// Length recorded in the file header. For read handles this is the
    /// content length; for a handle still being written it is updated at
    /// close.
    pub fn len(&self) -> u32 {
        self.header.len()
    }

    /// File name.
    pub fn name(&self) -> &str {
        self.header.name_str()
    }

    /// Header timestamp, seconds since the Unix epoch at last close.
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    /// Reads up to `buf.len()` bytes of content, following the sector chain
    /// as needed, and returns how many bytes were read. Zero means end of
    /// file. Without `ZERO_COPY` the data passes through the filesystem
    /// scratch buffer.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<D::Error>> {
        assert!(self.flags.contains(OpenFlags::READ), "file is not open for reading");
        let Some(mut current) = self.current_sector else {
            return Ok(0);
        };
        let mut total = 0;
        let mut rest = buf;
        while !rest.is_empty() {
            let remaining = (self.header.len() - self.position) as usize;
            if remaining == 0 {
                break;
            }
            let mut readable = SECTOR_SIZE - self.rw_pos_in_sector;
            if readable == 0 {
                let next = self.fs.fat.borrow().entry(current).next();
                if next == NEXT_EOF {
                    break;
                }
                current = next as usize;
                self.current_sector = Some(current);
                self.rw_pos_in_sector = 0;
                readable = SECTOR_SIZE;
            }
            let chunk = cmp::min(cmp::min(rest.len(), readable), remaining);
            let address = sector_address(current) + self.rw_pos_in_sector as u32;
            {
                let mut device = self.fs.device.borrow_mut();
                if self.flags.contains(OpenFlags::ZERO_COPY) {
                    device.read(address, &mut rest[..chunk]).map_err(Error::Io)?;
                } else {
                    let mut buff = self.fs.buff.borrow_mut();
                    device.read(address, &mut buff[..chunk]).map_err(Error::Io)?;
                    rest[..chunk].copy_from_slice(&buff[..chunk]);
                }
            }
            self.position += chunk as u32;
            self.rw_pos_in_sector += chunk;
            total += chunk;
            let tail = rest;
            rest = &mut tail[chunk..];
        }
        Ok(total)
    }

    /// Appends `buf` to the file.
    ///
    /// The first write allocates and erases the start sector, reserving its
    /// first page for the header. Chunks are assembled page-aligned in the
    /// scratch buffer with erased-byte padding on either side. If the
    /// allocator runs out of space the handle is marked failed and the
    /// partial chain is reclaimed when the handle is closed; the caller
    /// must still call `close`.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error<D::Error>> {
        assert!(self.flags.contains(OpenFlags::WRITE), "file is not open for writing");
        let fs = self.fs;
        let mut current = match self.current_sector {
            Some(sector) => sector,
            None => {
                let sector = self.allocate_erased()?;
                debug_assert!(sector >= TABLE_COUNT);
                debug!("file {} starts at sector {}", self.name(), sector);
                self.start_sector = Some(sector);
                self.current_sector = Some(sector);
                self.rw_pos_in_sector = PAGE_SIZE;
                self.header.reset_crc();
                sector
            }
        };
        let mut rest = buf;
        while !rest.is_empty() {
            let mut writeable = SECTOR_SIZE - self.rw_pos_in_sector;
            if writeable == 0 {
                let sector = self.allocate_erased()?;
                let mut fat = fs.fat.borrow_mut();
                let mut entry = fat.entry(current);
                entry.set_next(sector as u32);
                fat.set_entry(current, entry);
                let mut chained = fat.entry(sector);
                chained.clear(SectorFlags::SOF);
                fat.set_entry(sector, chained);
                drop(fat);
                current = sector;
                self.current_sector = Some(sector);
                self.rw_pos_in_sector = 0;
                writeable = SECTOR_SIZE;
            }
            let offset = self.rw_pos_in_sector % PAGE_SIZE;
            let page_base = self.rw_pos_in_sector - offset;
            let chunk = cmp::min(rest.len(), writeable);
            let mut program_len = offset + chunk;
            {
                let mut buff = fs.buff.borrow_mut();
                buff[..offset].fill(0xFF);
                buff[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
                if program_len % PAGE_SIZE != 0 {
                    let fill = PAGE_SIZE - program_len % PAGE_SIZE;
                    buff[program_len..program_len + fill].fill(0xFF);
                    program_len += fill;
                }
                debug_assert!(page_base + program_len <= SECTOR_SIZE);
                let address = sector_address(current) + page_base as u32;
                fs.device
                    .borrow_mut()
                    .program_page(address, &buff[..program_len])
                    .map_err(Error::Io)?;
            }
            self.header.update_crc(&rest[..chunk]);
            self.position += chunk as u32;
            self.rw_pos_in_sector += chunk;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    /// Closes the file.
    ///
    /// For write handles this is the atomic replacement point: the header
    /// page is programmed, the start sector's write bit is cleared, the
    /// previous version's chain (if any) is marked as garbage, and a single
    /// table commit publishes all of it at once. Power loss before the
    /// commit leaves the previous version visible; after it, the new one.
    /// A handle that failed with `NotEnoughSpace` reclaims its partial
    /// chain here and returns that error.
    pub fn close(mut self) -> Result<(), Error<D::Error>> {
        let fs = self.fs;
        if self.failed && self.flags.contains(OpenFlags::WRITE) {
            if let Some(start) = self.start_sector {
                let mut fat = fs.fat.borrow_mut();
                retire_chain(&mut fat, start)?;
            }
            debug!("file {} discarded", self.name());
            return Err(Error::NotEnoughSpace);
        }
        if self.flags.contains(OpenFlags::WRITE) {
            if let Some(start) = self.start_sector {
                self.header.set_len(self.position);
                self.header
                    .set_timestamp(fs.options.time_provider.unix_time());
                {
                    let mut buff = fs.buff.borrow_mut();
                    buff[..PAGE_SIZE].fill(0xFF);
                    self.header.serialize_into(&mut buff[..HEADER_SIZE]);
                    fs.device
                        .borrow_mut()
                        .program_page(sector_address(start), &buff[..PAGE_SIZE])
                        .map_err(Error::Io)?;
                }
                let mut fat = fs.fat.borrow_mut();
                let mut entry = fat.entry(start);
                entry.clear(SectorFlags::WRITE);
                fat.set_entry(start, entry);
            }
            if let Some(old) = self.old_file_sector {
                debug!("removing previous version at sector {}", old);
                let mut fat = fs.fat.borrow_mut();
                retire_chain(&mut fat, old)?;
            }
        }
        fs.commit_changes(false)?;
        debug!("file {} closed", self.name());
        Ok(())
    }

    fn allocate_erased(&mut self) -> Result<usize, Error<D::Error>> {
        let sector = match self.fs.find_empty_sector() {
            Ok(sector) => sector,
            Err(Error::NotEnoughSpace) => {
                self.failed = true;
                return Err(Error::NotEnoughSpace);
            }
            Err(err) => return Err(err),
        };
        self.fs
            .device
            .borrow_mut()
            .erase_sector(sector_address(sector))
            .map_err(Error::Io)?;
        Ok(sector)
    }
}
