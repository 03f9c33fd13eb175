//! FAT32 filesystem engine for block devices with 512-byte sectors.
//!
//! The engine is fully synchronous and allocation-free. A host provides a
//! [`BlockDevice`] (two sector callbacks) and mounts volumes into a
//! [`Mounts`] registry under a label; files and directories are then
//! addressed with absolute paths whose first component names the volume,
//! e.g. `/mnt/logs/boot.txt`.
//!
//! Long filenames are stored and matched as raw bytes (the low byte of each
//! UCS-2 unit); short 8.3 names are matched case-insensitively.

#![no_std]

mod chain;
mod device;
mod dir;
mod error;
mod file;
mod mounts;
mod names;
mod path;
mod time;
mod volume;

pub use device::{BlockDevice, DeviceError, SECTOR_SIZE};
pub use dir::{Attrs, Dir, DirInfo};
pub use error::FsError;
pub use file::{File, OpenFlags, Whence};
pub use mounts::{probe, Mounts, MAX_VOLUMES};
pub use time::{Clock, Timestamp};

/// Longest filename the LFN protocol can carry, in bytes.
pub const NAME_MAX: usize = 255;

/// Longest volume label accepted by [`Mounts::mount`], in bytes.
pub const LABEL_MAX: usize = 31;
