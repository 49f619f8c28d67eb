#![cfg_attr(not(feature = "std"), no_std)]

//! An append-only, power-fail-safe filesystem for NOR flash.
//!
//! The volume is a fixed number of uniform erase sectors; the first few
//! hold a dual-redundant allocation table with a rolling ring of CRC
//! commit slots, the rest hold file data as singly linked sector chains.
//! Every descriptor state transition is a 1→0 bit flip so the table can be
//! re-programmed in place, and closing a file publishes its new content
//! (and retires the previous version) in a single table commit, making
//! file replacement atomic across arbitrary power loss.
//!
//! The block driver is supplied by the caller through the [`BlockDevice`]
//! trait. A typical session mounts (formatting blank flash first), then
//! opens, reads, writes and closes files:
//!
//! ```ignore
//! let fs = FileSystem::new(flash, FsOptions::new());
//! if let Err(Error::UnformattedVolume) = fs.mount() {
//!     fs.format()?;
//!     fs.mount()?;
//! }
//! let mut file = fs.open_file("boot.cfg", OpenFlags::WRITE)?;
//! file.write(b"delay=3\n")?;
//! file.close()?;
//! ```

mod config;
mod crc;
mod device;
mod error;
mod file;
mod fs;
mod table;
mod time;

pub use crate::config::{ADDRESS_START, CRC_COUNT, PAGE_SIZE, SECTORS, SECTOR_SIZE, TABLE_COUNT};
pub use crate::device::BlockDevice;
pub use crate::error::Error;
pub use crate::file::{File, OpenFlags};
pub use crate::fs::{FileSystem, FsInfo, FsOptions};
pub use crate::time::TimeProvider;
