//! Compile-time geometry of the flash volume.
//!
//! All sizes are fixed at build time, matching how the driver layer carves
//! the device: `SECTORS` uniform erase sectors, the first `TABLE_COUNT` of
//! which hold the allocation table while the rest form the data area.

/// Size in bytes of one flash erase sector.
pub const SECTOR_SIZE: usize = 4096;

/// Size in bytes of one flash program page. Divides `SECTOR_SIZE`.
pub const PAGE_SIZE: usize = 256;

/// Total number of sectors in the volume.
pub const SECTORS: usize = 256;

/// Number of leading sectors reserved for the allocation table.
/// Must be even and at least 4 so two redundant pairs can rotate.
pub const TABLE_COUNT: usize = 4;

/// Number of commit slots in the table's rolling CRC ring.
pub const CRC_COUNT: usize = 63;

/// Absolute byte address of sector 0 on the block device.
pub const ADDRESS_START: u32 = 0;

const _: () = {
    assert!(SECTOR_SIZE.is_power_of_two());
    assert!(SECTOR_SIZE % PAGE_SIZE == 0);
    assert!(TABLE_COUNT >= 4 && TABLE_COUNT % 2 == 0);
    assert!(CRC_COUNT >= 2);
    assert!(SECTORS > TABLE_COUNT);
};
