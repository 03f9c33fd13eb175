//! Volume registry and the public filesystem API.
//!
//! Paths are absolute: `/<label>/<dir>/.../<name>`. The label picks the
//! mounted volume (first match in slot order), the remaining components
//! descend through the directory engine.

use log::{debug, info};

use crate::device::BlockDevice;
use crate::dir::{Attrs, Dir, DirInfo, Loc};
use crate::error::FsError;
use crate::file::{File, OpenFlags, Whence};
use crate::names::{self, SLOT_SIZE};
use crate::path::{rest_is_empty, split_component};
use crate::time::{epoch_clock, Clock, Timestamp};
use crate::volume::{probe_partition, Volume};

/// Default registry capacity.
pub const MAX_VOLUMES: usize = 4;

/// Checks whether `partition` of the device carries a mountable FAT32
/// filesystem, without mounting it.
///
/// Partition 0 matches a whole-device format or MBR entry 0; entries
/// 1..=3 require an MBR with a FAT32-LBA partition record.
pub fn probe<D: BlockDevice>(dev: &mut D, partition: usize) -> Result<(), FsError> {
    probe_partition(dev, partition).map(|_| ())
}

/// Where a path resolution ended up.
enum Target<'p> {
    /// The full path exists; the cursor rests on its short entry and
    /// `loc` marks the start of the entry group.
    Found { vol: usize, dir: Dir, loc: Loc },
    /// Every component but the last exists; the cursor iterates the
    /// directory that would contain `name`.
    Missing { vol: usize, dir: Dir, name: &'p str },
}

/// The mount registry. Owns every mounted [`Volume`] and the host clock.
pub struct Mounts<D: BlockDevice, const N: usize = MAX_VOLUMES> {
    slots: [Option<Volume<D>>; N],
    clock: Clock,
}

impl<D: BlockDevice, const N: usize> Default for Mounts<D, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: BlockDevice, const N: usize> Mounts<D, N> {
    pub fn new() -> Self {
        Mounts {
            slots: core::array::from_fn(|_| None),
            clock: epoch_clock,
        }
    }

    /// Installs the wall clock used to stamp directory entries. The
    /// default clock reports the FAT epoch, 1980-01-01.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    fn now(&self) -> Timestamp {
        (self.clock)()
    }

    fn volume_mut(&mut self, vol: usize) -> Result<&mut Volume<D>, FsError> {
        self.slots
            .get_mut(vol)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::Param)
    }

    fn find_label(&self, label: &[u8]) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|vol| vol.label.as_bytes() == label)
                .unwrap_or(false)
        })
    }

    /// Mounts `partition` of `dev` under `label` (at most
    /// [`crate::LABEL_MAX`] bytes, no `/`). The volume is placed in the
    /// first free slot; `Param` when the registry is full.
    pub fn mount(&mut self, dev: D, partition: usize, label: &str) -> Result<(), FsError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(FsError::Param)?;

        self.slots[slot] = Some(Volume::open(dev, partition, label)?);
        Ok(())
    }

    /// Syncs the volume and removes it from the registry, handing the
    /// device back. A failed sync leaves the volume mounted so nothing is
    /// silently dropped. Open handles against the volume become invalid.
    pub fn umount(&mut self, label: &str) -> Result<D, FsError> {
        let idx = self.find_label(label.as_bytes()).ok_or(FsError::Param)?;

        match self.slots[idx].as_mut() {
            Some(vol) => vol.sync_fs()?,
            None => return Err(FsError::Param),
        }

        let vol = self.slots[idx].take().ok_or(FsError::Param)?;
        info!("umount '{}'", label);
        Ok(vol.into_device())
    }

    /// Writes back any unsynced window and FSInfo state of the volume.
    /// Open files are not synced; use [`Self::sync_file`] for those.
    pub fn sync(&mut self, label: &str) -> Result<(), FsError> {
        let idx = self.find_label(label.as_bytes()).ok_or(FsError::Param)?;
        self.volume_mut(idx)?.sync_fs()
    }

    /// Resolves `path` down to its final component.
    fn follow_path<'p>(&mut self, path: &'p str) -> Result<Target<'p>, FsError> {
        let rest = path.strip_prefix('/').ok_or(FsError::Path)?;
        let (label, mut rest) = split_component(rest);
        if label.is_empty() {
            return Err(FsError::Path);
        }

        let vol_idx = self.find_label(label.as_bytes()).ok_or(FsError::Path)?;
        let vol = match self.slots[vol_idx].as_mut() {
            Some(vol) => vol,
            None => return Err(FsError::Param),
        };

        // Start at the root; no directory entry points to it.
        let mut dir = Dir {
            vol: vol_idx,
            sclust: vol.root_clust,
            clust: 0,
            sect: 0,
            idx: 0,
        };
        vol.dir_enter(&mut dir, vol.root_clust);

        let mut dir_clust = dir.clust;
        let mut enterable = true;
        let mut loc = Loc::default();

        loop {
            rest = rest.trim_start_matches('/');
            let (comp, after) = split_component(rest);
            if comp.is_empty() {
                return Ok(Target::Found {
                    vol: vol_idx,
                    dir,
                    loc,
                });
            }

            if !enterable {
                return Err(FsError::Path);
            }

            vol.dir_enter(&mut dir, dir_clust);
            match vol.dir_search(&mut dir, comp.as_bytes(), Some(&mut loc)) {
                Ok(()) => {}
                Err(FsError::Eof) => {
                    return if rest_is_empty(after) {
                        Ok(Target::Missing {
                            vol: vol_idx,
                            dir,
                            name: comp,
                        })
                    } else {
                        debug!("path: component '{}' not found", comp);
                        Err(FsError::Path)
                    };
                }
                Err(err) => return Err(err),
            }

            vol.move_window(dir.sect)?;
            let slot = &vol.win()[dir.idx..dir.idx + SLOT_SIZE];
            dir_clust = names::sfn_cluster(slot);
            enterable = names::sfn_attr(slot) & Attrs::DIR.bits() != 0;

            rest = after;
        }
    }

    /// Opens a file. `CREATE` makes a missing final component; without it
    /// a missing file reports `Denied`. See [`OpenFlags`] for `TRUNC` and
    /// `APPEND` behavior.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<File, FsError> {
        let now = self.now();

        let (vol_idx, dir) = match self.follow_path(path)? {
            Target::Found { vol, dir, .. } => {
                let v = self.volume_mut(vol)?;
                if v.dir_at_root(&dir) {
                    return Err(FsError::Denied);
                }
                (vol, dir)
            }
            Target::Missing { vol, mut dir, name } => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::Denied);
                }
                if name.len() > crate::NAME_MAX {
                    return Err(FsError::Param);
                }
                let v = self.volume_mut(vol)?;
                let clust = v.create_chain()?;
                v.dir_add(&mut dir, name.as_bytes(), Attrs::ARCHIVE, clust, now)?;
                (vol, dir)
            }
        };

        let v = self.volume_mut(vol_idx)?;
        v.move_window(dir.sect)?;
        let slot = &v.win()[dir.idx..dir.idx + SLOT_SIZE];
        let sclust = names::sfn_cluster(slot);
        let size = names::sfn_size(slot);
        let attr = Attrs::from_bits_truncate(names::sfn_attr(slot));

        let mut file = File::new(vol_idx, dir.sect, dir.idx, sclust, size, attr, flags);

        if file.size() != 0 && flags.contains(OpenFlags::TRUNC) {
            file.size = 0;
            file.modified = true;
        }

        let whence = if flags.contains(OpenFlags::APPEND) {
            Whence::End
        } else {
            Whence::Set
        };
        v.file_seek(&mut file, 0, whence)?;

        Ok(file)
    }

    /// Reads up to `buf.len()` bytes at the file cursor; `Ok(0)` at EOF.
    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize, FsError> {
        if !file.open {
            return Err(FsError::Param);
        }
        self.volume_mut(file.vol)?.file_read(file, buf)
    }

    /// Writes `data` at the file cursor, growing the file as needed.
    pub fn write(&mut self, file: &mut File, data: &[u8]) -> Result<usize, FsError> {
        if !file.open {
            return Err(FsError::Param);
        }
        self.volume_mut(file.vol)?.file_write(file, data)
    }

    /// Moves the file cursor. Forward seeks past the end pre-allocate
    /// clusters without zeroing them.
    pub fn seek(&mut self, file: &mut File, offset: i64, whence: Whence) -> Result<(), FsError> {
        if !file.open {
            return Err(FsError::Param);
        }
        self.volume_mut(file.vol)?.file_seek(file, offset, whence)
    }

    /// Persists buffered file data and the directory entry
    /// (size/timestamps), then syncs the volume.
    pub fn sync_file(&mut self, file: &mut File) -> Result<(), FsError> {
        if !file.open {
            return Err(FsError::Param);
        }
        let now = self.now();
        self.volume_mut(file.vol)?.file_sync(file, now)
    }

    /// Syncs and invalidates the handle.
    pub fn close(&mut self, file: &mut File) -> Result<(), FsError> {
        self.sync_file(file)?;
        file.open = false;
        Ok(())
    }

    /// Returns the decoded directory entry of `path`. The volume root has
    /// no entry of its own and reports a synthetic one named `/`.
    pub fn stat(&mut self, path: &str) -> Result<DirInfo, FsError> {
        match self.follow_path(path)? {
            Target::Missing { .. } => Err(FsError::Path),
            Target::Found { vol, mut dir, loc } => {
                let v = self.volume_mut(vol)?;
                if v.dir_at_root(&dir) {
                    let mut info = DirInfo {
                        name: heapless::Vec::new(),
                        attr: Attrs::DIR,
                        size: 0,
                        created: Timestamp::FAT_EPOCH,
                        modified: Timestamp::FAT_EPOCH,
                    };
                    info.name.push(b'/').map_err(|_| FsError::Broken)?;
                    return Ok(info);
                }

                // Re-seat on the group start so the long name decodes.
                dir.clust = v.sect_to_clust(loc.sect);
                dir.sect = loc.sect;
                dir.idx = loc.idx;
                v.dir_read_info(&mut dir)
            }
        }
    }

    /// Deletes a file or an empty directory. The root, read-only, system
    /// and label entries refuse with `Denied`, as does a directory that
    /// still holds entries.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        match self.follow_path(path)? {
            Target::Missing { .. } => Err(FsError::Path),
            Target::Found { vol, mut dir, loc } => {
                let v = self.volume_mut(vol)?;
                if v.dir_at_root(&dir) {
                    return Err(FsError::Denied);
                }

                v.move_window(dir.sect)?;
                let slot = &v.win()[dir.idx..dir.idx + SLOT_SIZE];
                let attr = names::sfn_attr(slot);
                let clust = names::sfn_cluster(slot);

                if attr & (Attrs::RO.bits() | Attrs::SYS.bits() | Attrs::LABEL.bits()) != 0 {
                    return Err(FsError::Denied);
                }

                if attr & Attrs::DIR.bits() != 0 {
                    let mut scan = dir;
                    v.dir_enter(&mut scan, clust);
                    v.dir_advance(&mut scan, 2)?; // . and ..

                    loop {
                        v.move_window(scan.sect)?;
                        let first = v.win()[scan.idx];
                        if first == names::SLOT_LAST {
                            break;
                        }
                        if first != names::SLOT_FREE {
                            return Err(FsError::Denied);
                        }
                        match v.dir_next(&mut scan) {
                            Ok(()) => {}
                            Err(FsError::Eof) => break,
                            Err(err) => return Err(err),
                        }
                    }
                }

                if clust >= 2 {
                    v.remove_chain(clust)?;
                }
                v.remove_entries(&mut dir, loc)?;
                v.sync_fs()
            }
        }
    }

    /// Creates a directory (with its `.`/`..` stubs) and returns a cursor
    /// into it. An existing entry at `path` refuses with `Denied`.
    pub fn create_dir(&mut self, path: &str) -> Result<Dir, FsError> {
        let now = self.now();

        match self.follow_path(path)? {
            Target::Found { .. } => Err(FsError::Denied),
            Target::Missing { vol, mut dir, name } => {
                if name.len() > crate::NAME_MAX {
                    return Err(FsError::Param);
                }
                let v = self.volume_mut(vol)?;

                let clust = v.create_chain()?;
                v.clust_clear(clust)?;
                v.write_dot_stubs(clust, dir.sclust, now)?;
                v.dir_add(&mut dir, name.as_bytes(), Attrs::DIR, clust, now)?;

                v.dir_enter(&mut dir, clust);
                v.sync_fs()?;
                Ok(dir)
            }
        }
    }

    /// Opens a directory for iteration. The path must name a directory
    /// (or a volume root).
    pub fn open_dir(&mut self, path: &str) -> Result<Dir, FsError> {
        match self.follow_path(path)? {
            Target::Missing { .. } => Err(FsError::Path),
            Target::Found { vol, mut dir, .. } => {
                let v = self.volume_mut(vol)?;
                if v.dir_at_root(&dir) {
                    return Ok(dir);
                }

                v.move_window(dir.sect)?;
                let slot = &v.win()[dir.idx..dir.idx + SLOT_SIZE];
                if names::sfn_attr(slot) & Attrs::DIR.bits() == 0 {
                    return Err(FsError::Path);
                }
                let clust = names::sfn_cluster(slot);
                v.dir_enter(&mut dir, clust);
                Ok(dir)
            }
        }
    }

    /// Decodes the entry at the cursor; `Eof` past the last entry. The
    /// cursor stays on the decoded entry — advance with
    /// [`Self::next_dir`].
    pub fn read_dir(&mut self, dir: &mut Dir) -> Result<DirInfo, FsError> {
        self.volume_mut(dir.vol)?.dir_read_info(dir)
    }

    /// Advances the cursor one slot. `Eof` at the end of the directory;
    /// rewind to iterate again.
    pub fn next_dir(&mut self, dir: &mut Dir) -> Result<(), FsError> {
        self.volume_mut(dir.vol)?.dir_next(dir)
    }

    /// Puts the cursor back on the directory's first slot.
    pub fn rewind_dir(&mut self, dir: &mut Dir) -> Result<(), FsError> {
        let v = self.volume_mut(dir.vol)?;
        let sclust = dir.sclust;
        v.dir_at_clust(dir, sclust);
        Ok(())
    }
}
