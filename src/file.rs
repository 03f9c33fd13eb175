//! File cursor engine: maps byte offsets onto the cluster chain and
//! buffers payload I/O in a per-handle sector buffer.
//!
//! The handle's buffer is independent of the volume's sector window, so
//! streaming file data does not evict cached FAT or directory sectors.
//! Directory-entry updates at sync do go through the window.

use bitflags::bitflags;

use crate::chain::FatEntry;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir::Attrs;
use crate::error::FsError;
use crate::time::Timestamp;
use crate::volume::Volume;

bitflags! {
    /// Open-mode flags for [`crate::Mounts::open`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Position the cursor at the end of the file after opening.
        const APPEND = 0x04;
        /// Reset the size to zero. The old cluster chain is reused by
        /// subsequent writes; the directory entry reflects the new size
        /// at the next sync.
        const TRUNC = 0x08;
        /// Create the file when the final path component is missing.
        const CREATE = 0x10;
    }
}

/// Origin for [`crate::Mounts::seek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Curr,
    End,
}

/// Open file handle.
///
/// Closed by [`crate::Mounts::close`]; using a closed handle reports
/// `Param`. Dropping an unclosed handle loses buffered writes.
pub struct File {
    pub(crate) vol: usize,
    pub(crate) open: bool,

    /// Location of the file's short entry, patched at sync.
    pub(crate) dir_sect: u32,
    pub(crate) dir_idx: usize,

    pub(crate) sclust: u32,
    /// Current cluster along the chain and its index from the start.
    pub(crate) clust: u32,
    pub(crate) clust_idx: u32,
    /// Sector holding the byte at `offset`. `None` while the cursor is
    /// parked on a cluster boundary whose cluster is not allocated yet.
    pub(crate) sect: Option<u32>,
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) attr: Attrs,
    pub(crate) flags: OpenFlags,

    pub(crate) accessed: bool,
    pub(crate) modified: bool,

    buf: [u8; SECTOR_SIZE],
    buf_sect: Option<u32>,
    buf_dirty: bool,
}

impl File {
    pub(crate) fn new(
        vol: usize,
        dir_sect: u32,
        dir_idx: usize,
        sclust: u32,
        size: u32,
        attr: Attrs,
        flags: OpenFlags,
    ) -> File {
        File {
            vol,
            open: true,
            dir_sect,
            dir_idx,
            sclust,
            clust: sclust,
            clust_idx: 0,
            sect: None,
            offset: 0,
            size,
            attr,
            flags,
            accessed: false,
            modified: false,
            buf: [0; SECTOR_SIZE],
            buf_sect: None,
            buf_dirty: false,
        }
    }

    /// Current byte offset.
    pub fn tell(&self) -> u32 {
        self.offset
    }

    /// Current file size. Extensions become visible on disk at sync.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn attr(&self) -> Attrs {
        self.attr
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Makes the handle's buffer hold the cursor's sector, flushing any
    /// dirty content the buffer held for another sector first.
    fn file_load(&mut self, file: &mut File) -> Result<(), FsError> {
        let sect = file.sect.ok_or(FsError::Broken)?;
        if file.buf_sect == Some(sect) {
            return Ok(());
        }

        self.file_flush(file)?;
        if let Err(err) = self.dev.read_sector(sect, &mut file.buf) {
            file.buf_sect = None;
            return Err(err.into());
        }
        file.buf_sect = Some(sect);
        Ok(())
    }

    fn file_flush(&mut self, file: &mut File) -> Result<(), FsError> {
        if file.buf_dirty {
            let sect = file.buf_sect.ok_or(FsError::Broken)?;
            self.dev.write_sector(sect, &file.buf)?;
            file.buf_dirty = false;
        }
        Ok(())
    }

    /// Allocates the cluster a parked cursor points past, then loads its
    /// first sector. No-op when the cursor already has a sector.
    fn file_materialize(&mut self, file: &mut File) -> Result<(), FsError> {
        if file.sect.is_some() {
            return Ok(());
        }

        file.clust = self.stretch_chain(file.clust)?;
        file.clust_idx += 1;
        file.sect = Some(
            self.clust_to_sect(file.clust)
                + ((file.offset / SECTOR_SIZE as u32) & self.clust_msk),
        );
        self.file_load(file)
    }

    /// Moves the cursor to an absolute offset, walking the cluster chain.
    ///
    /// Seeking into unallocated space stretches the chain, so a forward
    /// seek doubles as pre-allocation; the spanned bytes are whatever the
    /// device held. A destination exactly on the boundary past the last
    /// cluster parks the cursor instead — the cluster is allocated by the
    /// first write that needs it. Offsets outside `[0, 2^32)` report
    /// `Eof`.
    pub(crate) fn file_seek(
        &mut self,
        file: &mut File,
        offset: i64,
        whence: Whence,
    ) -> Result<(), FsError> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Curr => file.offset as i64,
            Whence::End => file.size as i64,
        };

        let off64 = base.checked_add(offset).ok_or(FsError::Eof)?;
        if off64 < 0 || off64 > u32::MAX as i64 {
            return Err(FsError::Eof);
        }
        let off = off64 as u32;

        if file.sclust < 2 {
            return Err(FsError::Broken);
        }

        let clust_size = (SECTOR_SIZE as u32) << self.clust_shift;
        let dst_clust = off / clust_size;

        if dst_clust < file.clust_idx {
            // Chains only link forward; restart from the head.
            file.clust = file.sclust;
            file.clust_idx = 0;
        }

        while file.clust_idx < dst_clust {
            match self.get_fat(file.clust)? {
                FatEntry::Next(next) => {
                    file.clust = next;
                    file.clust_idx += 1;
                }
                FatEntry::Last => {
                    if file.clust_idx + 1 == dst_clust && off & (clust_size - 1) == 0 {
                        // Park on the boundary; nothing at `off` is
                        // accessed until a write materializes it.
                        file.sect = None;
                        file.offset = off;
                        return Ok(());
                    }
                    file.clust = self.stretch_chain(file.clust)?;
                    file.clust_idx += 1;
                }
                FatEntry::Free | FatEntry::Bad => return Err(FsError::Broken),
            }
        }

        file.sect = Some(
            self.clust_to_sect(file.clust) + ((off / SECTOR_SIZE as u32) & self.clust_msk),
        );
        file.offset = off;

        self.file_load(file)
    }

    /// Copies up to `out.len()` bytes from the cursor, stopping at the
    /// file size. Returns the number of bytes copied (zero at EOF).
    pub(crate) fn file_read(&mut self, file: &mut File, out: &mut [u8]) -> Result<usize, FsError> {
        if !file.flags.contains(OpenFlags::READ) {
            return Err(FsError::Denied);
        }
        file.accessed = true;

        let mut done = 0;
        while done < out.len() && file.offset < file.size {
            self.file_load(file)?;

            let idx = (file.offset as usize) % SECTOR_SIZE;
            let cnt = (out.len() - done)
                .min(SECTOR_SIZE - idx)
                .min((file.size - file.offset) as usize);
            out[done..done + cnt].copy_from_slice(&file.buf[idx..idx + cnt]);
            done += cnt;

            self.file_seek(file, cnt as i64, Whence::Curr)?;
        }

        Ok(done)
    }

    /// Copies `data` at the cursor, extending the chain and the size as
    /// needed. The new size reaches the directory entry at sync.
    pub(crate) fn file_write(&mut self, file: &mut File, data: &[u8]) -> Result<usize, FsError> {
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::Denied);
        }
        file.modified = true;
        file.accessed = true;

        let mut done = 0;
        while done < data.len() {
            self.file_materialize(file)?;
            self.file_load(file)?;

            let idx = (file.offset as usize) % SECTOR_SIZE;
            let cnt = (data.len() - done).min(SECTOR_SIZE - idx);
            file.buf[idx..idx + cnt].copy_from_slice(&data[done..done + cnt]);
            file.buf_dirty = true;
            done += cnt;

            self.file_seek(file, cnt as i64, Whence::Curr)?;

            if file.offset > file.size {
                file.size = file.offset;
            }
        }

        Ok(done)
    }

    /// Flushes the handle's buffer and, when the file was touched, patches
    /// its directory entry (access date; size, modification stamp and the
    /// ARCHIVE bit when modified) before syncing the volume.
    pub(crate) fn file_sync(&mut self, file: &mut File, now: Timestamp) -> Result<(), FsError> {
        self.file_flush(file)?;

        if file.accessed || file.modified {
            self.move_window(file.dir_sect)?;

            let (date, time) = now.encode();
            let accessed = file.accessed;
            let modified = file.modified;
            let size = file.size;
            let base = file.dir_idx;

            let win = self.win_mut();
            let slot = &mut win[base..base + 32];
            if accessed {
                slot[18..20].copy_from_slice(&date.to_le_bytes());
            }
            if modified {
                slot[11] |= Attrs::ARCHIVE.bits();
                slot[22..24].copy_from_slice(&time.to_le_bytes());
                slot[24..26].copy_from_slice(&date.to_le_bytes());
                slot[28..32].copy_from_slice(&size.to_le_bytes());
            }
        }

        self.sync_fs()?;

        file.accessed = false;
        file.modified = false;
        Ok(())
    }
}
