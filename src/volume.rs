//! Mounted volume state: geometry, the shared sector window, and FSInfo
//! synchronization.
//!
//! Every FAT, directory and FSInfo access goes through the single cached
//! window sector so that repeated writes to one LBA coalesce and dirty
//! data is flushed before the window moves elsewhere. File payload I/O
//! deliberately bypasses the window (each file handle carries its own
//! sector buffer).

use heapless::String;
use log::{debug, info, warn};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::FsError;
use crate::LABEL_MAX;

const FSINFO_HEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TAIL_SIG: u32 = 0xaa55_0000;

const MBR_PART_OFF: usize = 446;
const MBR_PART_FAT32_LBA: u8 = 0x0c;

const EXT_FLAG_MIRROR: u16 = 1 << 7;
const EXT_FLAG_ACT: u16 = 0x000f;
const EXT_FLAG_SECOND: u16 = 0x0001;

pub(crate) struct Volume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) label: String<LABEL_MAX>,

    /// log2 of sectors per cluster.
    pub(crate) clust_shift: u32,
    /// Sectors per cluster minus one.
    pub(crate) clust_msk: u32,
    pub(crate) clust_cnt: u32,
    pub(crate) root_clust: u32,
    pub(crate) data_sect: u32,
    /// Active FAT start, then mirror start (0 when mirroring is off).
    pub(crate) fat_sect: [u32; 2],
    pub(crate) info_sect: u32,

    pub(crate) free_cnt: u32,
    pub(crate) last_used: u32,
    pub(crate) info_dirty: bool,

    win: [u8; SECTOR_SIZE],
    win_sect: Option<u32>,
    win_dirty: bool,
}

fn bpb_u16(buf: &[u8; SECTOR_SIZE], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn bpb_u32(buf: &[u8; SECTOR_SIZE], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Validates a sector as a FAT32 BPB this engine can drive.
fn check_fat(buf: &[u8; SECTOR_SIZE]) -> bool {
    if buf[0] != 0xeb && buf[0] != 0xe9 {
        return false;
    }

    let fat_cnt = buf[16];
    if fat_cnt != 2 {
        return false;
    }

    // Legacy FAT12/16 fields must be zero on FAT32.
    if bpb_u16(buf, 17) != 0 || bpb_u16(buf, 19) != 0 || bpb_u16(buf, 22) != 0 {
        return false;
    }

    if bpb_u16(buf, 48) != 1 {
        return false;
    }

    if &buf[82..90] != b"FAT32   " {
        return false;
    }

    if bpb_u16(buf, 11) != SECTOR_SIZE as u16 {
        return false;
    }

    let ext_flags = bpb_u16(buf, 40);
    if (ext_flags & EXT_FLAG_MIRROR) == 0 && (ext_flags & EXT_FLAG_ACT) > 1 {
        return false;
    }

    let sect_per_clust = buf[13];
    if sect_per_clust == 0 || !sect_per_clust.is_power_of_two() {
        return false;
    }

    // The cluster count, not any label, decides the FAT type.
    let res_sect_cnt = bpb_u16(buf, 14) as u32;
    let sect_per_fat = bpb_u32(buf, 36);
    let sect_cnt = bpb_u32(buf, 32)
        .wrapping_sub(res_sect_cnt + fat_cnt as u32 * sect_per_fat);
    sect_cnt / sect_per_clust as u32 >= 65525
}

fn part_lba(buf: &[u8; SECTOR_SIZE], partition: usize) -> Option<u32> {
    if buf[510] != 0x55 || buf[511] != 0xaa {
        return None;
    }

    let base = MBR_PART_OFF + partition * 16;
    if buf[base + 4] != MBR_PART_FAT32_LBA {
        return None;
    }
    Some(bpb_u32(buf, base + 8))
}

/// Locates the BPB for `partition` and returns its LBA together with the
/// sector contents.
///
/// Partition 0 matches either a whole-device FAT32 format or MBR entry 0;
/// partitions 1..=3 require an MBR.
pub(crate) fn probe_partition<D: BlockDevice>(
    dev: &mut D,
    partition: usize,
) -> Result<(u32, [u8; SECTOR_SIZE]), FsError> {
    if partition > 3 {
        return Err(FsError::Param);
    }

    let mut buf = [0u8; SECTOR_SIZE];
    dev.read_sector(0, &mut buf)?;

    if check_fat(&buf) {
        // Unpartitioned drive; only index 0 can name it.
        return if partition == 0 {
            Ok((0, buf))
        } else {
            Err(FsError::NoFat)
        };
    }

    let lba = match part_lba(&buf, partition) {
        Some(lba) if lba != 0 => lba,
        _ => {
            debug!("probe: no FAT32 entry in partition slot {}", partition);
            return Err(FsError::NoFat);
        }
    };

    dev.read_sector(lba, &mut buf)?;
    if !check_fat(&buf) {
        debug!("probe: partition {} at lba {} is not FAT32", partition, lba);
        return Err(FsError::NoFat);
    }
    Ok((lba, buf))
}

impl<D: BlockDevice> Volume<D> {
    /// Builds the volume record from a validated BPB and loads FSInfo.
    pub(crate) fn open(
        mut dev: D,
        partition: usize,
        label: &str,
    ) -> Result<Volume<D>, FsError> {
        if label.is_empty() || label.len() > LABEL_MAX || label.contains('/') {
            return Err(FsError::Param);
        }

        let (lba, bpb) = probe_partition(&mut dev, partition)?;

        let sect_per_clust = bpb[13] as u32;
        let res_sect_cnt = bpb_u16(&bpb, 14) as u32;
        let sect_per_fat = bpb_u32(&bpb, 36);
        let ext_flags = bpb_u16(&bpb, 40);

        let mirror = (ext_flags & EXT_FLAG_MIRROR) != 0;
        let use_first = (ext_flags & EXT_FLAG_SECOND) == 0;

        let fat_0 = lba + res_sect_cnt;
        let fat_1 = lba + res_sect_cnt + sect_per_fat;

        let info_sect = lba + bpb_u16(&bpb, 48) as u32;

        // FSInfo carries the allocator hints this engine maintains.
        let mut info = [0u8; SECTOR_SIZE];
        dev.read_sector(info_sect, &mut info)?;

        let free_cnt = bpb_u32(&info, 488);
        let next_free = bpb_u32(&info, 492);

        if bpb_u32(&info, 0) != FSINFO_HEAD_SIG
            || bpb_u32(&info, 484) != FSINFO_STRUCT_SIG
            || bpb_u32(&info, 508) != FSINFO_TAIL_SIG
            || free_cnt == 0xffff_ffff
            || next_free == 0xffff_ffff
        {
            warn!("mount: FSInfo at lba {} is invalid", info_sect);
            return Err(FsError::NoFat);
        }

        let mut vol_label = String::new();
        vol_label.push_str(label).map_err(|_| FsError::Param)?;

        let vol = Volume {
            dev,
            label: vol_label,
            clust_shift: sect_per_clust.trailing_zeros(),
            clust_msk: sect_per_clust - 1,
            clust_cnt: sect_per_fat.saturating_mul(SECTOR_SIZE as u32 / 4),
            root_clust: bpb_u32(&bpb, 44),
            data_sect: lba + res_sect_cnt + 2 * sect_per_fat,
            fat_sect: [
                if use_first { fat_0 } else { fat_1 },
                if mirror {
                    if use_first {
                        fat_1
                    } else {
                        fat_0
                    }
                } else {
                    0
                },
            ],
            info_sect,
            free_cnt,
            last_used: next_free,
            info_dirty: false,
            win: [0; SECTOR_SIZE],
            win_sect: None,
            win_dirty: false,
        };

        info!(
            "mount '{}': {} clusters of {} sectors, {} free, mirror={}",
            vol.label,
            vol.clust_cnt,
            sect_per_clust,
            vol.free_cnt,
            mirror
        );
        Ok(vol)
    }

    pub(crate) fn into_device(self) -> D {
        self.dev
    }

    pub(crate) fn clust_to_sect(&self, clust: u32) -> u32 {
        ((clust - 2) << self.clust_shift) + self.data_sect
    }

    pub(crate) fn sect_to_clust(&self, sect: u32) -> u32 {
        ((sect - self.data_sect) >> self.clust_shift) + 2
    }

    pub(crate) fn sect_per_clust(&self) -> u32 {
        1 << self.clust_shift
    }

    /// Read access to the cached sector.
    pub(crate) fn win(&self) -> &[u8; SECTOR_SIZE] {
        &self.win
    }

    /// Write access to the cached sector; marks it dirty.
    pub(crate) fn win_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        self.win_dirty = true;
        &mut self.win
    }

    /// Writes the window back if it holds unsynced changes.
    pub(crate) fn flush_window(&mut self) -> Result<(), FsError> {
        if self.win_dirty {
            let sect = self.win_sect.ok_or(FsError::Broken)?;
            self.dev.write_sector(sect, &self.win)?;
            self.win_dirty = false;
        }
        Ok(())
    }

    /// Points the window at `sect`, flushing first when it moves away from
    /// a dirty sector.
    pub(crate) fn move_window(&mut self, sect: u32) -> Result<(), FsError> {
        if self.win_sect != Some(sect) {
            self.flush_window()?;
            if let Err(err) = self.dev.read_sector(sect, &mut self.win) {
                // A failed read may have clobbered the cached content.
                self.win_sect = None;
                return Err(err.into());
            }
            self.win_sect = Some(sect);
        }
        Ok(())
    }

    /// Zeroes every sector of a cluster through the window.
    pub(crate) fn clust_clear(&mut self, clust: u32) -> Result<(), FsError> {
        self.flush_window()?;

        let mut sect = self.clust_to_sect(clust);
        self.win = [0; SECTOR_SIZE];
        for _ in 0..self.sect_per_clust() {
            self.win_sect = Some(sect);
            self.win_dirty = true;
            self.flush_window()?;
            sect += 1;
        }
        Ok(())
    }

    /// Flushes the window, then rewrites the FSInfo hints if the allocator
    /// changed them since the last sync.
    pub(crate) fn sync_fs(&mut self) -> Result<(), FsError> {
        self.flush_window()?;

        if self.info_dirty {
            self.move_window(self.info_sect)?;
            let free_cnt = self.free_cnt;
            let last_used = self.last_used;
            let win = self.win_mut();
            win[488..492].copy_from_slice(&free_cnt.to_le_bytes());
            win[492..496].copy_from_slice(&last_used.to_le_bytes());
            self.flush_window()?;
            self.info_dirty = false;
        }
        Ok(())
    }
}
