//! Directory engine: cursor traversal over 32-byte entry slots, LFN-aware
//! search, entry-group insertion and deletion, and `.`/`..` stubs.

use bitflags::bitflags;
use heapless::Vec;

use crate::chain::FatEntry;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::FsError;
use crate::names::{
    self, NameBuf, ATTR_LFN, LFN_HEAD_MSK, LFN_OFFSETS, LFN_SEQ_MSK, LFN_SLOT_MAX, SLOT_FREE,
    SLOT_LAST, SLOT_SIZE,
};
use crate::time::Timestamp;
use crate::volume::Volume;
use crate::NAME_MAX;

bitflags! {
    /// On-disk attribute bits of a short directory entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attrs: u8 {
        const RO = 0x01;
        const HIDDEN = 0x02;
        const SYS = 0x04;
        const LABEL = 0x08;
        const DIR = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// Cursor over one directory's entry slots.
///
/// Obtained from [`crate::Mounts::open_dir`] or
/// [`crate::Mounts::create_dir`]; holds no device resources and may be
/// freely copied or discarded.
#[derive(Clone, Copy, Debug)]
pub struct Dir {
    pub(crate) vol: usize,
    /// First cluster of the directory this cursor iterates.
    pub(crate) sclust: u32,
    pub(crate) clust: u32,
    pub(crate) sect: u32,
    /// Byte offset of the current slot within the sector.
    pub(crate) idx: usize,
}

/// Decoded directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirInfo {
    /// Raw filename bytes. Long names pass the UCS-2 low byte through
    /// unchanged, so this is not guaranteed to be UTF-8.
    pub name: Vec<u8, NAME_MAX>,
    pub attr: Attrs,
    pub size: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl DirInfo {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(Attrs::DIR)
    }

    /// The name as text, when it happens to be valid UTF-8.
    pub fn name_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.name).ok()
    }
}

/// Position of the first slot of an entry group, kept for deletion.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Loc {
    pub sect: u32,
    pub idx: usize,
}

impl<D: BlockDevice> Volume<D> {
    /// Seats the cursor on the first slot of `clust`.
    pub(crate) fn dir_at_clust(&self, dir: &mut Dir, clust: u32) {
        dir.clust = clust;
        dir.sect = self.clust_to_sect(clust);
        dir.idx = 0;
    }

    /// Makes `clust` the directory the cursor iterates. Cluster zero means
    /// the root (the convention used by `..` entries).
    pub(crate) fn dir_enter(&self, dir: &mut Dir, clust: u32) {
        let clust = if clust == 0 { self.root_clust } else { clust };
        dir.sclust = clust;
        self.dir_at_clust(dir, clust);
    }

    pub(crate) fn dir_at_root(&self, dir: &Dir) -> bool {
        dir.clust == self.root_clust
            && dir.sect == self.clust_to_sect(self.root_clust)
            && dir.idx == 0
    }

    /// Advances one slot, following the cluster chain across sector and
    /// cluster boundaries. `Eof` at the end of the chain.
    pub(crate) fn dir_next(&mut self, dir: &mut Dir) -> Result<(), FsError> {
        dir.idx += SLOT_SIZE;
        if dir.idx < SECTOR_SIZE {
            return Ok(());
        }

        dir.idx = 0;
        dir.sect += 1;

        if dir.sect - self.clust_to_sect(dir.clust) < self.sect_per_clust() {
            return Ok(());
        }

        match self.get_fat(dir.clust)? {
            FatEntry::Last => Err(FsError::Eof),
            FatEntry::Free | FatEntry::Bad => Err(FsError::Broken),
            FatEntry::Next(next) => {
                self.dir_at_clust(dir, next);
                Ok(())
            }
        }
    }

    pub(crate) fn dir_advance(&mut self, dir: &mut Dir, cnt: usize) -> Result<(), FsError> {
        for _ in 0..cnt {
            self.dir_next(dir)?;
        }
        Ok(())
    }

    /// Like [`Self::dir_next`] but grows the directory by one zeroed
    /// cluster instead of reporting `Eof`. Used while inserting entries.
    fn dir_next_stretch(&mut self, dir: &mut Dir) -> Result<(), FsError> {
        match self.dir_next(dir) {
            Err(FsError::Eof) => {
                let next = self.stretch_chain(dir.clust)?;
                self.dir_at_clust(dir, next);
                self.clust_clear(dir.clust)
            }
            other => other,
        }
    }

    /// Reads the LFN group starting at the cursor into `out` and leaves
    /// the cursor on the slot that follows it (the owning SFN, on a
    /// healthy volume).
    fn parse_lfn_name(&mut self, dir: &mut Dir, out: &mut NameBuf) -> Result<(), FsError> {
        self.move_window(dir.sect)?;
        let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];

        let seq = slot[0];
        out.crc = slot[13];
        out.len = 0;

        if seq & LFN_HEAD_MSK == 0 {
            return Err(FsError::Broken);
        }
        let mut cnt = (seq & LFN_SEQ_MSK) as usize;
        if cnt == 0 || cnt > LFN_SLOT_MAX {
            return Err(FsError::Broken);
        }

        while cnt > 0 {
            cnt -= 1;

            self.move_window(dir.sect)?;
            let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];
            if slot[11] != ATTR_LFN || slot[13] != out.crc {
                return Err(FsError::Broken);
            }

            for (i, &off) in LFN_OFFSETS.iter().enumerate() {
                let c = slot[off];
                if c == 0xff {
                    // Padding may only follow the 0x0000 terminator.
                    return Err(FsError::Broken);
                }
                if c == 0x00 {
                    break;
                }
                out.buf[13 * cnt + i] = c;
                out.len += 1;
            }

            self.dir_next(dir)?;
        }

        if out.len <= NAME_MAX {
            Ok(())
        } else {
            Err(FsError::Broken)
        }
    }

    /// Searches the directory for `name` from its start. On success the
    /// cursor rests on the matching SFN and `loc`, when given, holds the
    /// first slot of its entry group. `Eof` when the name is absent.
    ///
    /// Long names match byte-exact; bare short entries match their 8.3
    /// encoding, which makes them ASCII case-insensitive.
    pub(crate) fn dir_search(
        &mut self,
        dir: &mut Dir,
        name: &[u8],
        mut loc: Option<&mut Loc>,
    ) -> Result<(), FsError> {
        let sfn_name = names::encode_sfn(name);
        let mut lfn = NameBuf::new();

        let sclust = dir.sclust;
        self.dir_at_clust(dir, sclust);

        loop {
            self.move_window(dir.sect)?;
            let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];

            if names::slot_is_last(slot) {
                return Err(FsError::Eof);
            }
            if names::slot_is_free(slot) {
                self.dir_next(dir)?;
                continue;
            }

            if let Some(loc) = loc.as_deref_mut() {
                loc.sect = dir.sect;
                loc.idx = dir.idx;
            }

            if names::slot_is_lfn(slot) {
                self.parse_lfn_name(dir, &mut lfn)?;

                self.move_window(dir.sect)?;
                let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];
                let mut short = [0u8; 11];
                short.copy_from_slice(&slot[..11]);

                if names::slot_is_free(slot)
                    || names::slot_is_lfn(slot)
                    || lfn.crc != names::sfn_checksum(&short)
                {
                    return Err(FsError::Broken);
                }
                if lfn.bytes() == name {
                    return Ok(());
                }
            } else if slot[..11] == sfn_name {
                return Ok(());
            }

            self.dir_next(dir)?;
        }
    }

    /// Inserts an entry group for `name` with the given attribute and
    /// first cluster, stamping creation/modification/access times with
    /// `now`. The cursor is left on the new SFN. The entry size is zero;
    /// file sizes are maintained by the file cursor at sync.
    pub(crate) fn dir_add(
        &mut self,
        dir: &mut Dir,
        name: &[u8],
        attr: Attrs,
        clust: u32,
        now: Timestamp,
    ) -> Result<(), FsError> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::Param);
        }
        let lfns = names::lfn_slots(name.len());

        let sclust = dir.sclust;
        self.dir_enter(dir, sclust);

        // Find lfns + 1 consecutive free slots, growing the chain when the
        // scan runs off the end. Remember where the run starts.
        let mut eod = false;
        let mut run = Loc::default();
        let mut cnt = 0;
        while cnt < lfns + 1 {
            self.move_window(dir.sect)?;
            let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];
            let free = eod || names::slot_is_free(slot);
            let last = names::slot_is_last(slot);

            if free {
                if cnt == 0 {
                    run.sect = dir.sect;
                    run.idx = dir.idx;
                }
                cnt += 1;
            } else {
                cnt = 0;
            }
            if last {
                eod = true;
            }

            self.dir_next_stretch(dir)?;
        }

        if eod {
            // The scan consumed the old end marker, so the slot after the
            // new SFN becomes the new one. The cursor already rests there.
            self.move_window(dir.sect)?;
            let idx = dir.idx;
            self.win_mut()[idx] = SLOT_LAST;
        }

        dir.clust = self.sect_to_clust(run.sect);
        dir.sect = run.sect;
        dir.idx = run.idx;

        let sfn_name = names::encode_sfn(name);
        let crc = names::sfn_checksum(&sfn_name);

        // LFN slots go out in sequence lfns..1; the physically-first one
        // carries the head bit.
        let mut head = LFN_HEAD_MSK;
        for i in (1..=lfns).rev() {
            self.move_window(dir.sect)?;
            let idx = dir.idx;
            let win = self.win_mut();
            let slot = &mut win[idx..idx + SLOT_SIZE];

            let pos = 13 * (i - 1);
            names::put_lfn_frag(slot, &name[pos..name.len().min(pos + 13)]);
            slot[0] = head | i as u8;
            slot[11] = ATTR_LFN;
            slot[12] = 0;
            slot[13] = crc;
            slot[26] = 0;
            slot[27] = 0;
            head = 0;

            self.dir_next(dir)?;
        }

        let (date, time) = now.encode();
        self.move_window(dir.sect)?;
        let idx = dir.idx;
        let win = self.win_mut();
        let slot = &mut win[idx..idx + SLOT_SIZE];

        slot[..11].copy_from_slice(&sfn_name);
        slot[11] = attr.bits();
        slot[12] = 0;
        slot[13] = 0;
        slot[14..16].copy_from_slice(&time.to_le_bytes());
        slot[16..18].copy_from_slice(&date.to_le_bytes());
        slot[18..20].copy_from_slice(&date.to_le_bytes());
        slot[20..22].copy_from_slice(&((clust >> 16) as u16).to_le_bytes());
        slot[22..24].copy_from_slice(&time.to_le_bytes());
        slot[24..26].copy_from_slice(&date.to_le_bytes());
        slot[26..28].copy_from_slice(&(clust as u16).to_le_bytes());
        slot[28..32].fill(0);

        Ok(())
    }

    /// Marks every slot from the group start `loc` through the cursor's
    /// slot (the owning SFN) as free.
    pub(crate) fn remove_entries(&mut self, dir: &mut Dir, loc: Loc) -> Result<(), FsError> {
        let end_sect = dir.sect;
        let end_idx = dir.idx;

        dir.clust = self.sect_to_clust(loc.sect);
        dir.sect = loc.sect;
        dir.idx = loc.idx;

        loop {
            self.move_window(dir.sect)?;
            let idx = dir.idx;
            self.win_mut()[idx] = SLOT_FREE;

            if dir.sect == end_sect && dir.idx == end_idx {
                return Ok(());
            }
            self.dir_next(dir)?;
        }
    }

    /// Decodes the entry group at the cursor, skipping free slots and the
    /// `.`/`..` stubs. The cursor is left on the decoded SFN; `Eof` at the
    /// end marker.
    pub(crate) fn dir_read_info(&mut self, dir: &mut Dir) -> Result<DirInfo, FsError> {
        let mut name = NameBuf::new();

        loop {
            self.move_window(dir.sect)?;
            let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];

            if names::slot_is_last(slot) {
                return Err(FsError::Eof);
            }
            if names::slot_is_free(slot) {
                self.dir_next(dir)?;
                continue;
            }

            if names::slot_is_lfn(slot) {
                self.parse_lfn_name(dir, &mut name)?;

                self.move_window(dir.sect)?;
                let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];
                let mut short = [0u8; 11];
                short.copy_from_slice(&slot[..11]);
                if names::slot_is_free(slot) || name.crc != names::sfn_checksum(&short) {
                    return Err(FsError::Broken);
                }
            } else {
                if slot[0] == b'.' {
                    self.dir_next(dir)?;
                    continue;
                }
                names::decode_sfn(slot, &mut name);
            }

            let slot = &self.win()[dir.idx..dir.idx + SLOT_SIZE];
            let attr = Attrs::from_bits_truncate(slot[11]);
            let cre_time = u16::from_le_bytes([slot[14], slot[15]]);
            let cre_date = u16::from_le_bytes([slot[16], slot[17]]);
            let mod_time = u16::from_le_bytes([slot[22], slot[23]]);
            let mod_date = u16::from_le_bytes([slot[24], slot[25]]);
            let size = names::sfn_size(slot);

            let mut info = DirInfo {
                name: Vec::new(),
                attr,
                size,
                created: Timestamp::decode(cre_date, cre_time),
                modified: Timestamp::decode(mod_date, mod_time),
            };
            info.name
                .extend_from_slice(name.bytes())
                .map_err(|_| FsError::Broken)?;
            return Ok(info);
        }
    }

    /// Writes the `.` and `..` entries into the first (pre-cleared) sector
    /// of a fresh directory cluster. `..` records cluster zero when the
    /// parent is the root, per FAT convention.
    pub(crate) fn write_dot_stubs(
        &mut self,
        clust: u32,
        parent_clust: u32,
        now: Timestamp,
    ) -> Result<(), FsError> {
        let parent = if parent_clust == self.root_clust {
            0
        } else {
            parent_clust
        };
        let (date, time) = now.encode();
        let sect = self.clust_to_sect(clust);

        self.move_window(sect)?;
        let win = self.win_mut();

        for (slot_idx, (name_bytes, target)) in
            [(&b".          "[..], clust), (&b"..         "[..], parent)]
                .into_iter()
                .enumerate()
        {
            let base = slot_idx * SLOT_SIZE;
            let slot = &mut win[base..base + SLOT_SIZE];
            slot[..11].copy_from_slice(name_bytes);
            slot[11] = Attrs::DIR.bits();
            slot[14..16].copy_from_slice(&time.to_le_bytes());
            slot[16..18].copy_from_slice(&date.to_le_bytes());
            slot[18..20].copy_from_slice(&date.to_le_bytes());
            slot[20..22].copy_from_slice(&((target >> 16) as u16).to_le_bytes());
            slot[22..24].copy_from_slice(&time.to_le_bytes());
            slot[24..26].copy_from_slice(&date.to_le_bytes());
            slot[26..28].copy_from_slice(&(target as u16).to_le_bytes());
        }

        Ok(())
    }
}
