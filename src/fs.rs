use core::cell::{Cell, RefCell};

use log::{debug, error, info, trace, warn};

use crate::config::{ADDRESS_START, CRC_COUNT, SECTORS, SECTOR_SIZE, TABLE_COUNT};
use crate::crc;
use crate::device::BlockDevice;
use crate::error::Error;
use crate::file::{File, FileHeader, OpenFlags, HEADER_SIZE, NAME_SIZE};
use crate::table::{Fat, SectorEntry, SectorFlags, NEXT_EOF};
use crate::time::{TimeProvider, DEFAULT_TIME_PROVIDER};

/// Filesystem mount options.
///
/// Options are specified as an argument for the `FileSystem::new` method.
pub struct FsOptions {
    pub(crate) time_provider: &'static (dyn TimeProvider + Sync),
}

impl FsOptions {
    /// Creates a `FsOptions` struct with default options.
    pub fn new() -> Self {
        FsOptions {
            time_provider: &DEFAULT_TIME_PROVIDER,
        }
    }

    /// Changes the provider used to timestamp file headers at close.
    pub fn time_provider(mut self, time_provider: &'static (dyn TimeProvider + Sync)) -> Self {
        self.time_provider = time_provider;
        self
    }
}

/// Volume statistics returned by `FileSystem::info`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FsInfo {
    file_count: u32,
    bytes_used: u32,
    bytes_free: u32,
    bytes_available: u32,
    bytes_uncollected: u32,
    swap_count: u32,
    garbage_count: u32,
}

impl FsInfo {
    /// Number of live files.
    pub fn file_count(&self) -> u32 {
        self.file_count
    }

    /// Total bytes of live file content.
    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// Bytes in sectors that are free or reclaimable by garbage collection.
    pub fn bytes_free(&self) -> u32 {
        self.bytes_free
    }

    /// Bytes in sectors ready for allocation right now.
    pub fn bytes_available(&self) -> u32 {
        self.bytes_available
    }

    /// Bytes in dead sectors awaiting the next garbage collection.
    pub fn bytes_uncollected(&self) -> u32 {
        self.bytes_uncollected
    }

    /// Number of table rotations performed over the volume's lifetime.
    pub fn swap_count(&self) -> u32 {
        self.swap_count
    }

    /// Number of garbage collection passes performed.
    pub fn garbage_count(&self) -> u32 {
        self.garbage_count
    }
}

pub(crate) fn sector_address(sector: usize) -> u32 {
    ADDRESS_START + (sector * SECTOR_SIZE) as u32
}

/// Marks every sector of the chain starting at `start` as garbage in the
/// in-memory table. The walk is bounded and every link must stay inside the
/// data area; violating either means the chain metadata is corrupt.
pub(crate) fn retire_chain<E>(fat: &mut Fat, start: usize) -> Result<(), Error<E>> {
    let mut current = start;
    let mut next = fat.entry(current).next();
    let mut limit = SECTOR_SIZE;
    loop {
        fat.set_entry(current, SectorEntry::GARBAGE);
        if next == NEXT_EOF {
            return Ok(());
        }
        let index = next as usize;
        if index < TABLE_COUNT || index >= SECTORS {
            error!("chain link {} leaves the data area", index);
            return Err(Error::CorruptedFileSystem);
        }
        current = index;
        next = fat.entry(current).next();
        limit -= 1;
        if limit == 0 {
            error!("chain starting at sector {} does not terminate", start);
            return Err(Error::CorruptedFileSystem);
        }
    }
}

/// A mounted NOR flash volume.
///
/// `FileSystem` owns the block device, the in-memory allocation table and
/// the single sector-sized scratch buffer shared by every operation. All
/// operations run to completion before another begins; the structure is not
/// meant to be shared between threads.
pub struct FileSystem<D: BlockDevice> {
    pub(crate) device: RefCell<D>,
    pub(crate) fat: RefCell<Fat>,
    pub(crate) buff: RefCell<[u8; SECTOR_SIZE]>,
    pub(crate) options: FsOptions,
    first_fat: Cell<usize>,
    mounted: Cell<bool>,
    seed: Cell<u32>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Creates a new filesystem object instance. Performs no I/O; call
    /// `mount` (or `format` followed by `mount`) before anything else.
    pub fn new(device: D, options: FsOptions) -> Self {
        FileSystem {
            device: RefCell::new(device),
            fat: RefCell::new(Fat::new()),
            buff: RefCell::new([0xFF; SECTOR_SIZE]),
            options,
            first_fat: Cell::new(0),
            mounted: Cell::new(false),
            seed: Cell::new(0x9E37_79B9),
        }
    }

    /// Mounts the volume.
    ///
    /// Locates the newest valid allocation table among the reserved table
    /// sectors, falling back to the redundant copy if the primary fails its
    /// CRC. Returns `Error::UnformattedVolume` if the whole table area is
    /// blank. Chains left behind by a writer that lost power are marked as
    /// garbage; the reclamation is persisted by the next table commit.
    pub fn mount(&self) -> Result<(), Error<D::Error>> {
        let mut sector_used = [false; TABLE_COUNT];
        {
            let mut device = self.device.borrow_mut();
            let mut probe = [0u8; 4];
            for (sector, used) in sector_used.iter_mut().enumerate() {
                device
                    .read(sector_address(sector), &mut probe)
                    .map_err(Error::Io)?;
                *used = probe != [0xFF; 4];
            }
        }
        if sector_used.iter().all(|&used| !used) {
            debug!("table area is blank");
            return Err(Error::UnformattedVolume);
        }
        // The newest pair starts at the first used table sector that
        // follows a blank one, scanning the ring at most twice.
        let mut first = 0;
        let mut seen_blank = false;
        for i in 0..TABLE_COUNT * 2 {
            let index = i % TABLE_COUNT;
            if seen_blank && sector_used[index] {
                first = index;
                break;
            }
            if !sector_used[index] {
                seen_blank = true;
            }
        }
        self.first_fat.set(first);
        debug!("validating table {}", first);
        match self.validate_table(first) {
            Ok(()) => {}
            Err(Error::CrcMismatch) => {
                self.validate_table((first + 1) % TABLE_COUNT)?;
                info!("secondary table used");
            }
            Err(err) => return Err(err),
        }
        self.sweep_orphans()?;
        {
            let fat = self.fat.borrow();
            let seed = fat
                .swap_count()
                .wrapping_mul(31)
                .wrapping_add(fat.garbage_count())
                ^ 0x9E37_79B9;
            self.seed.set(seed | 1);
        }
        self.mounted.set(true);
        debug!("volume mounted");
        Ok(())
    }

    /// Formats the volume: erases any used table sector and writes a blank
    /// allocation table to the first redundant pair. Does not mount.
    pub fn format(&self) -> Result<(), Error<D::Error>> {
        {
            let mut device = self.device.borrow_mut();
            let mut buff = self.buff.borrow_mut();
            for sector in 0..TABLE_COUNT {
                device
                    .read(sector_address(sector), &mut buff[..])
                    .map_err(Error::Io)?;
                if buff.iter().any(|&byte| byte != 0xFF) {
                    device
                        .erase_sector(sector_address(sector))
                        .map_err(Error::Io)?;
                }
            }
        }
        let mut fat = self.fat.borrow_mut();
        *fat = Fat::new();
        fat.set_swap_count(0);
        fat.set_garbage_count(0);
        let checksum = fat.checksum_past_slot(0);
        fat.set_commit_slot(0, crc::encode_hex(checksum));
        let mut device = self.device.borrow_mut();
        device
            .program_page(sector_address(0), fat.as_bytes())
            .map_err(Error::Io)?;
        device
            .program_page(sector_address(1), fat.as_bytes())
            .map_err(Error::Io)?;
        self.first_fat.set(0);
        debug!("volume formatted");
        Ok(())
    }

    /// Returns volume statistics and logs a listing of all live files.
    pub fn info(&self) -> Result<FsInfo, Error<D::Error>> {
        assert!(self.mounted.get(), "volume is not mounted");
        let fat = self.fat.borrow();
        let mut device = self.device.borrow_mut();
        let mut buff = self.buff.borrow_mut();
        let mut stats = FsInfo {
            file_count: 0,
            bytes_used: 0,
            bytes_free: 0,
            bytes_available: 0,
            bytes_uncollected: 0,
            swap_count: fat.swap_count(),
            garbage_count: fat.garbage_count(),
        };
        for sector in TABLE_COUNT..SECTORS {
            let entry = fat.entry(sector);
            if entry.is_file_start() {
                device
                    .read(sector_address(sector), &mut buff[..HEADER_SIZE])
                    .map_err(Error::Io)?;
                let header = FileHeader::deserialize(&buff[..HEADER_SIZE]);
                info!("{:>10} {:>8} {}", header.timestamp(), header.len(), header.name_str());
                stats.file_count += 1;
                stats.bytes_used += header.len();
            } else if entry.is_available() {
                stats.bytes_available += SECTOR_SIZE as u32;
                stats.bytes_free += SECTOR_SIZE as u32;
            } else if !entry.is_active() {
                stats.bytes_uncollected += SECTOR_SIZE as u32;
                stats.bytes_free += SECTOR_SIZE as u32;
            }
        }
        info!(
            "{} files, {} bytes used, {} free, {} ready, {} awaiting gc, {} swaps, {} gc passes",
            stats.file_count,
            stats.bytes_used,
            stats.bytes_free,
            stats.bytes_available,
            stats.bytes_uncollected,
            stats.swap_count,
            stats.garbage_count
        );
        Ok(stats)
    }

    /// Opens a file.
    ///
    /// `READ` requires the file to exist and positions the handle at the
    /// start of its content. `WRITE` stages a replacement: the new content
    /// becomes visible, and any previous version unreachable, in the single
    /// table commit issued by `File::close`. `ZERO_COPY` makes reads bypass
    /// the shared scratch buffer. `READ` takes precedence when both access
    /// flags are given.
    pub fn open_file(&self, name: &str, flags: OpenFlags) -> Result<File<'_, D>, Error<D::Error>> {
        assert!(self.mounted.get(), "volume is not mounted");
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() > NAME_SIZE - 1 {
            return Err(Error::InvalidFileNameLength);
        }
        if name_bytes.contains(&0) {
            return Err(Error::UnsupportedFileNameCharacter);
        }
        let found = self.file_search(name_bytes)?;
        if flags.contains(OpenFlags::READ) {
            match found {
                Some((header, sector)) => {
                    debug!("file {} opened for reading", name);
                    Ok(File::open_read(self, header, sector, flags))
                }
                None => Err(Error::NotFound),
            }
        } else if flags.contains(OpenFlags::WRITE) {
            let file = match found {
                Some((header, sector)) => {
                    debug!("sector {} marked for removal", sector);
                    File::open_write(self, header, Some(sector), flags)
                }
                None => File::open_write(self, FileHeader::new(name_bytes), None, flags),
            };
            debug!("file {} opened for writing", name);
            Ok(file)
        } else {
            Err(Error::InvalidInput)
        }
    }

    /// Reads the given table sector into the in-memory image and checks it
    /// against the checksum stored in its newest commit slot.
    pub(crate) fn validate_table(&self, table: usize) -> Result<(), Error<D::Error>> {
        let mut fat = self.fat.borrow_mut();
        self.device
            .borrow_mut()
            .read(sector_address(table), fat.as_bytes_mut())
            .map_err(Error::Io)?;
        let slot = fat.newest_commit_slot();
        trace!("table {} newest commit slot {}", table, slot);
        let stored = crc::decode_hex(fat.commit_slot(slot));
        let computed = fat.checksum_past_slot(slot);
        if stored != Some(computed) {
            warn!("table {} crc failure, computed {:08X}", table, computed);
            return Err(Error::CrcMismatch);
        }
        debug!("table {} crc match", table);
        Ok(())
    }

    /// Persists the in-memory table.
    ///
    /// While slots remain in the commit ring (and no swap is forced) this
    /// programs the image in place over both sectors of the current pair;
    /// every descriptor transition only clears bits, so no erase is needed.
    /// A full ring or a forced swap rotates the pair forward by two with an
    /// erase-program-erase sequence per copy, keeping at least one intact,
    /// CRC-valid table on flash at every intermediate step.
    pub(crate) fn commit_changes(&self, force_swap: bool) -> Result<(), Error<D::Error>> {
        let mut fat = self.fat.borrow_mut();
        let mut device = self.device.borrow_mut();
        let slot = fat.newest_commit_slot();
        let first = self.first_fat.get();
        if slot == CRC_COUNT - 1 || force_swap {
            let old_primary = first;
            let old_secondary = (first + 1) % TABLE_COUNT;
            let new_primary = (first + 2) % TABLE_COUNT;
            let new_secondary = (first + 3) % TABLE_COUNT;
            debug!(
                "rotating tables {} {} -> {} {}",
                old_primary, old_secondary, new_primary, new_secondary
            );
            let new_swap_count = fat.swap_count().wrapping_add(1);
            fat.set_swap_count(new_swap_count);
            fat.reset_commit_ring();
            let checksum = fat.checksum_past_slot(0);
            fat.set_commit_slot(0, crc::encode_hex(checksum));

            device
                .erase_sector(sector_address(new_primary))
                .map_err(Error::Io)?;
            device
                .program_page(sector_address(new_primary), fat.as_bytes())
                .map_err(Error::Io)?;
            device
                .erase_sector(sector_address(old_primary))
                .map_err(Error::Io)?;
            device
                .erase_sector(sector_address(new_secondary))
                .map_err(Error::Io)?;
            device
                .program_page(sector_address(new_secondary), fat.as_bytes())
                .map_err(Error::Io)?;
            device
                .erase_sector(sector_address(old_secondary))
                .map_err(Error::Io)?;
            self.first_fat.set(new_primary);
            return Ok(());
        }
        fat.clear_commit_slot(slot);
        let checksum = fat.checksum_past_slot(slot + 1);
        fat.set_commit_slot(slot + 1, crc::encode_hex(checksum));
        device
            .program_page(sector_address(first), fat.as_bytes())
            .map_err(Error::Io)?;
        device
            .program_page(sector_address((first + 1) % TABLE_COUNT), fat.as_bytes())
            .map_err(Error::Io)?;
        trace!("tables {} {} committed in slot {}", first, (first + 1) % TABLE_COUNT, slot + 1);
        Ok(())
    }

    /// Claims a free data sector, garbage collecting once if none is left.
    /// The caller erases the sector before the first program; a descriptor
    /// in the erased state only promises "erase before use".
    pub(crate) fn find_empty_sector(&self) -> Result<usize, Error<D::Error>> {
        let start = self.random_data_sector();
        {
            let mut fat = self.fat.borrow_mut();
            if let Some(sector) = claim_available(&mut fat, start, SECTORS) {
                return Ok(sector);
            }
            if let Some(sector) = claim_available(&mut fat, TABLE_COUNT, start) {
                return Ok(sector);
            }
        }
        self.garbage_collect()?;
        let mut fat = self.fat.borrow_mut();
        claim_available(&mut fat, TABLE_COUNT, SECTORS).ok_or(Error::NotEnoughSpace)
    }

    /// Resets every dead descriptor to the erased state and persists the
    /// new free list with a forced table rotation. No flash is erased here;
    /// data sectors are erased lazily when they are next allocated.
    pub(crate) fn garbage_collect(&self) -> Result<(), Error<D::Error>> {
        let mut collected = false;
        {
            let mut fat = self.fat.borrow_mut();
            for sector in TABLE_COUNT..SECTORS {
                if !fat.entry(sector).is_active() {
                    fat.set_entry(sector, SectorEntry::EMPTY);
                    collected = true;
                }
            }
            if collected {
                let count = fat.garbage_count().wrapping_add(1);
                fat.set_garbage_count(count);
            }
        }
        if collected {
            debug!("garbage collected");
            self.commit_changes(true)
        } else {
            Err(Error::NotEnoughSpace)
        }
    }

    /// Scans the data area for a live file with the given name and returns
    /// its header and start sector.
    pub(crate) fn file_search(
        &self,
        name: &[u8],
    ) -> Result<Option<(FileHeader, usize)>, Error<D::Error>> {
        let fat = self.fat.borrow();
        let mut device = self.device.borrow_mut();
        let mut buff = self.buff.borrow_mut();
        for sector in TABLE_COUNT..SECTORS {
            if fat.entry(sector).is_file_start() {
                device
                    .read(sector_address(sector), &mut buff[..HEADER_SIZE])
                    .map_err(Error::Io)?;
                let header = FileHeader::deserialize(&buff[..HEADER_SIZE]);
                if header.name_bytes() == name {
                    debug!("file {} found at sector {}", header.name_str(), sector);
                    return Ok(Some((header, sector)));
                }
            }
        }
        Ok(None)
    }

    // Writers that lose power after a mid-write table commit (a garbage
    // collection triggered by their own allocations) leave a chain whose
    // start descriptor still has the write bit set. Reclaim such chains in
    // memory; the next commit persists it.
    fn sweep_orphans(&self) -> Result<(), Error<D::Error>> {
        let mut fat = self.fat.borrow_mut();
        let mut orphans = 0u32;
        for sector in TABLE_COUNT..SECTORS {
            let entry = fat.entry(sector);
            if entry.is_sof() && entry.is_write() && entry.is_active() && !entry.is_available() {
                retire_chain(&mut fat, sector)?;
                orphans += 1;
            }
        }
        if orphans > 0 {
            warn!("{} interrupted write(s) discarded", orphans);
        }
        Ok(())
    }

    // Wear leveling: start each allocation scan at a pseudo-random data
    // sector so erases spread over the device.
    fn random_data_sector(&self) -> usize {
        let mut x = self.seed.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed.set(x);
        let sector = x as usize % SECTORS;
        if sector < TABLE_COUNT {
            SECTORS / 2
        } else {
            sector
        }
    }
}

fn claim_available(fat: &mut Fat, from: usize, to: usize) -> Option<usize> {
    for sector in from..to {
        let mut entry = fat.entry(sector);
        if entry.is_available() {
            entry.clear(SectorFlags::AVAILABLE);
            fat.set_entry(sector, entry);
            trace!("claimed sector {}", sector);
            return Some(sector);
        }
    }
    None
}
