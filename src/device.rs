//! Block device contract.
//!
//! The filesystem drives the flash through three primitives and never
//! touches the device any other way. NOR semantics apply: erase is
//! sector-granular and sets every bit to 1, programming is page-granular
//! and can only clear bits from 1 to 0.

/// Interface to the underlying NOR flash driver.
///
/// Addresses are absolute byte offsets. `erase_sector` must be called with
/// a sector-aligned address, `program_page` with a page-aligned address and
/// a length that is a multiple of the page size. Reads are unrestricted.
pub trait BlockDevice {
    /// Error type returned by the driver.
    type Error: core::fmt::Debug;

    /// Erases the sector beginning at `address`.
    fn erase_sector(&mut self, address: u32) -> Result<(), Self::Error>;

    /// Programs `data` starting at `address`. Only 1→0 bit transitions are
    /// valid; programming anything else is undefined on NOR flash.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Reads `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    type Error = T::Error;

    fn erase_sector(&mut self, address: u32) -> Result<(), Self::Error> {
        (**self).erase_sector(address)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        (**self).program_page(address, data)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(address, buf)
    }
}
