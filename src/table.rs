use bitflags::bitflags;

use crate::config::{CRC_COUNT, SECTORS, SECTOR_SIZE};
use crate::crc::{self, CRC_INIT};

// On-flash layout of the allocation table image:
// a ring of CRC_COUNT 8-byte commit slots, one descriptor word per sector,
// the two rotation counters, then erased padding up to the sector size.
pub(crate) const COMMIT_SLOT_SIZE: usize = 8;
const ENTRY_SIZE: usize = 4;
const ENTRIES_OFFSET: usize = CRC_COUNT * COMMIT_SLOT_SIZE;
const SWAP_COUNT_OFFSET: usize = ENTRIES_OFFSET + SECTORS * ENTRY_SIZE;
const GARBAGE_COUNT_OFFSET: usize = SWAP_COUNT_OFFSET + 4;

const _: () = assert!(GARBAGE_COUNT_OFFSET + 4 <= SECTOR_SIZE);

/// `next` value terminating a file chain.
pub(crate) const NEXT_EOF: u32 = 0x00FF_FFFF;

bitflags! {
    /// Flag bits of a sector descriptor.
    ///
    /// The low 24 bits of the descriptor word hold the chain link; flags sit
    /// above it so that every legal state transition only clears bits and
    /// can be programmed in place without an erase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SectorFlags: u32 {
        /// Sector is erased and free for allocation.
        const AVAILABLE = 1 << 24;
        /// Sector is the start of a file and holds the header page.
        const SOF = 1 << 25;
        /// Sector belongs to a file that has not been finalized yet.
        const WRITE = 1 << 26;
        /// Sector is part of live data; cleared when it becomes garbage.
        const ACTIVE = 1 << 27;
    }
}

/// One sector descriptor: a little-endian `u32` packing a 24-bit `next`
/// link (`NEXT_EOF` terminated) under the `SectorFlags` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectorEntry(u32);

impl SectorEntry {
    /// Freshly erased descriptor: all bits set.
    pub(crate) const EMPTY: SectorEntry = SectorEntry(0xFFFF_FFFF);
    /// Dead descriptor awaiting garbage collection: all bits cleared, so it
    /// is reachable from any prior state by programming alone.
    pub(crate) const GARBAGE: SectorEntry = SectorEntry(0);

    const NEXT_MASK: u32 = 0x00FF_FFFF;

    fn flags(self) -> SectorFlags {
        SectorFlags::from_bits_truncate(self.0)
    }

    pub(crate) fn is_available(self) -> bool {
        self.flags().contains(SectorFlags::AVAILABLE)
    }

    pub(crate) fn is_active(self) -> bool {
        self.flags().contains(SectorFlags::ACTIVE)
    }

    pub(crate) fn is_write(self) -> bool {
        self.flags().contains(SectorFlags::WRITE)
    }

    pub(crate) fn is_sof(self) -> bool {
        self.flags().contains(SectorFlags::SOF)
    }

    /// Start sector of a finalized live file: `sof` and `active` set with
    /// `available` and `write` cleared. Only such sectors carry a header.
    pub(crate) fn is_file_start(self) -> bool {
        self.flags() == SectorFlags::SOF | SectorFlags::ACTIVE
    }

    pub(crate) fn next(self) -> u32 {
        self.0 & Self::NEXT_MASK
    }

    pub(crate) fn set_next(&mut self, next: u32) {
        self.0 = (self.0 & !Self::NEXT_MASK) | (next & Self::NEXT_MASK);
    }

    pub(crate) fn clear(&mut self, flags: SectorFlags) {
        self.0 &= !flags.bits();
    }
}

/// In-memory image of one allocation table, exactly one sector in size.
pub(crate) struct Fat {
    image: [u8; SECTOR_SIZE],
}

impl Fat {
    /// Returns a blank image: everything in the erased state.
    pub(crate) fn new() -> Self {
        Fat { image: [0xFF; SECTOR_SIZE] }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let raw = &self.image[offset..offset + 4];
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn entry(&self, sector: usize) -> SectorEntry {
        debug_assert!(sector < SECTORS);
        SectorEntry(self.read_u32(ENTRIES_OFFSET + sector * ENTRY_SIZE))
    }

    pub(crate) fn set_entry(&mut self, sector: usize, entry: SectorEntry) {
        debug_assert!(sector < SECTORS);
        self.write_u32(ENTRIES_OFFSET + sector * ENTRY_SIZE, entry.0);
    }

    pub(crate) fn swap_count(&self) -> u32 {
        self.read_u32(SWAP_COUNT_OFFSET)
    }

    pub(crate) fn set_swap_count(&mut self, count: u32) {
        self.write_u32(SWAP_COUNT_OFFSET, count);
    }

    pub(crate) fn garbage_count(&self) -> u32 {
        self.read_u32(GARBAGE_COUNT_OFFSET)
    }

    pub(crate) fn set_garbage_count(&mut self, count: u32) {
        self.write_u32(GARBAGE_COUNT_OFFSET, count);
    }

    pub(crate) fn commit_slot(&self, slot: usize) -> &[u8] {
        &self.image[slot * COMMIT_SLOT_SIZE..(slot + 1) * COMMIT_SLOT_SIZE]
    }

    /// Index of the most significant commit slot that is not erased.
    /// A slot cleared to zeros still counts as used.
    pub(crate) fn newest_commit_slot(&self) -> usize {
        (1..CRC_COUNT)
            .rev()
            .find(|&slot| self.commit_slot(slot)[0] != 0xFF)
            .unwrap_or(0)
    }

    /// Clears `slot` to all-zero bits, a legal in-place program.
    pub(crate) fn clear_commit_slot(&mut self, slot: usize) {
        self.image[slot * COMMIT_SLOT_SIZE..(slot + 1) * COMMIT_SLOT_SIZE].fill(0);
    }

    /// Resets the whole ring to the erased state. Only valid right before a
    /// table rotation, which erases the target sectors first.
    pub(crate) fn reset_commit_ring(&mut self) {
        self.image[..CRC_COUNT * COMMIT_SLOT_SIZE].fill(0xFF);
    }

    pub(crate) fn set_commit_slot(&mut self, slot: usize, ascii: [u8; 8]) {
        self.image[slot * COMMIT_SLOT_SIZE..(slot + 1) * COMMIT_SLOT_SIZE].copy_from_slice(&ascii);
    }

    /// Checksum of the image from just past `slot` to the end of the sector,
    /// the region a commit slot vouches for.
    pub(crate) fn checksum_past_slot(&self, slot: usize) -> u32 {
        let mut crc = CRC_INIT;
        crc::crc32(&self.image[(slot + 1) * COMMIT_SLOT_SIZE..], &mut crc);
        crc
    }
}
