//! Cluster-chain allocator over the file allocation table.
//!
//! FAT entries are 32 bits on disk but only the low 28 carry the link;
//! the top nibble is reserved and must survive rewrites.

use log::warn;

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::FsError;
use crate::volume::Volume;

/// 32-bit entries per FAT sector.
const ENTRIES_PER_SECT: u32 = (SECTOR_SIZE / 4) as u32;

const ENTRY_MSK: u32 = 0x0fff_ffff;
const ENTRY_BAD: u32 = 0x0fff_fff7;
const ENTRY_LAST_MIN: u32 = 0x0fff_fff8;
/// Value written to terminate a chain.
const ENTRY_EOC: u32 = 0x0fff_ffff;

/// Decoded state of one FAT entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FatEntry {
    Free,
    /// Link to the next cluster of the chain.
    Next(u32),
    Last,
    Bad,
}

impl<D: BlockDevice> Volume<D> {
    /// Reads and classifies the FAT entry of `clust` from the active FAT.
    pub(crate) fn get_fat(&mut self, clust: u32) -> Result<FatEntry, FsError> {
        let sect = self.fat_sect[0] + clust / ENTRIES_PER_SECT;
        self.move_window(sect)?;

        let off = (clust % ENTRIES_PER_SECT) as usize * 4;
        let win = self.win();
        let val = u32::from_le_bytes([win[off], win[off + 1], win[off + 2], win[off + 3]])
            & ENTRY_MSK;

        if val == 0 {
            Ok(FatEntry::Free)
        } else if val == ENTRY_BAD {
            Ok(FatEntry::Bad)
        } else if val >= ENTRY_LAST_MIN {
            Ok(FatEntry::Last)
        } else if val >= 2 && val < self.clust_cnt {
            Ok(FatEntry::Next(val))
        } else {
            Err(FsError::Broken)
        }
    }

    fn put_fat_at(&mut self, fat_sect: u32, clust: u32, val: u32) -> Result<(), FsError> {
        let sect = fat_sect + clust / ENTRIES_PER_SECT;
        self.move_window(sect)?;

        let off = (clust % ENTRIES_PER_SECT) as usize * 4;
        let win = self.win_mut();
        let old = u32::from_le_bytes([win[off], win[off + 1], win[off + 2], win[off + 3]]);
        let new = (old & !ENTRY_MSK) | (val & ENTRY_MSK);
        win[off..off + 4].copy_from_slice(&new.to_le_bytes());
        Ok(())
    }

    /// Writes a FAT entry through to the active table and, when mirroring
    /// is enabled, to the mirror — active first.
    pub(crate) fn put_fat(&mut self, clust: u32, val: u32) -> Result<(), FsError> {
        self.put_fat_at(self.fat_sect[0], clust, val)?;
        if self.fat_sect[1] != 0 {
            self.put_fat_at(self.fat_sect[1], clust, val)?;
        }
        Ok(())
    }

    /// Appends one cluster to the chain ending at `prev`, or starts a new
    /// chain when `prev` is zero. Returns the new cluster.
    ///
    /// The cluster right after `prev` is probed first so sequential writes
    /// stay contiguous; otherwise the scan starts at the last allocation.
    pub(crate) fn stretch_chain(&mut self, prev: u32) -> Result<u32, FsError> {
        self.info_dirty = true;

        let mut clust;
        let mut scan = true;

        if prev != 0 {
            clust = prev + 1;
            if clust >= self.clust_cnt {
                clust = 2;
            }
            if self.get_fat(clust)? == FatEntry::Free {
                scan = false;
            }
        } else {
            clust = 0;
        }

        if scan {
            clust = self.last_used;
            loop {
                clust += 1;
                if clust >= self.clust_cnt {
                    clust = 2;
                }
                if clust == self.last_used {
                    warn!("'{}': no free cluster left", self.label);
                    return Err(FsError::Full);
                }
                if self.get_fat(clust)? == FatEntry::Free {
                    break;
                }
            }
        }

        self.put_fat(clust, ENTRY_EOC)?;
        if prev != 0 {
            self.put_fat(prev, clust)?;
        }

        self.last_used = clust;
        self.free_cnt = self.free_cnt.saturating_sub(1);

        self.sync_fs()?;
        Ok(clust)
    }

    /// Allocates the first cluster of a fresh chain.
    pub(crate) fn create_chain(&mut self) -> Result<u32, FsError> {
        self.stretch_chain(0)
    }

    /// Frees every cluster of the chain starting at `clust`.
    pub(crate) fn remove_chain(&mut self, mut clust: u32) -> Result<(), FsError> {
        self.info_dirty = true;

        loop {
            let entry = self.get_fat(clust)?;
            match entry {
                FatEntry::Free | FatEntry::Bad => {
                    warn!("'{}': chain hits {:?} entry at cluster {}", self.label, entry, clust);
                    return Err(FsError::Broken);
                }
                _ => {}
            }

            self.put_fat(clust, 0)?;
            self.free_cnt = self.free_cnt.saturating_add(1);

            match entry {
                FatEntry::Next(next) => clust = next,
                _ => break,
            }
        }

        self.sync_fs()
    }
}
