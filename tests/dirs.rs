//! Directory create/list/unlink behavior and the long-filename protocol.

mod common;

use common::*;
use fatvol::{FsError, Mounts, OpenFlags, NAME_MAX};

fn setup() -> (SharedDisk, Mounts<SharedDisk>) {
    let disk = SharedDisk::new();
    mkfs(&disk);
    let mut fs = Mounts::<SharedDisk>::new();
    fs.set_clock(test_clock);
    fs.mount(disk.clone(), 0, "mnt").unwrap();
    (disk, fs)
}

const RW: OpenFlags = OpenFlags::READ.union(OpenFlags::WRITE);
const CREATE: OpenFlags = RW.union(OpenFlags::CREATE);

fn touch(fs: &mut Mounts<SharedDisk>, path: &str) {
    let mut file = fs.open(path, CREATE).unwrap();
    fs.close(&mut file).unwrap();
}

/// Collects every entry name, in on-disk order.
fn list(fs: &mut Mounts<SharedDisk>, path: &str) -> Vec<String> {
    let mut dir = fs.open_dir(path).unwrap();
    let mut out = Vec::new();
    loop {
        match fs.read_dir(&mut dir) {
            Ok(info) => {
                out.push(String::from_utf8(info.name.to_vec()).unwrap());
            }
            Err(FsError::Eof) => break,
            Err(err) => panic!("read_dir failed: {err:?}"),
        }
        match fs.next_dir(&mut dir) {
            Ok(()) => {}
            Err(FsError::Eof) => break,
            Err(err) => panic!("next_dir failed: {err:?}"),
        }
    }
    out
}

#[test]
fn root_lists_every_entry_once_in_order() {
    let (_disk, mut fs) = setup();

    assert_eq!(list(&mut fs, "/mnt"), Vec::<String>::new());

    touch(&mut fs, "/mnt/a.txt");
    touch(&mut fs, "/mnt/b.txt");
    touch(&mut fs, "/mnt/c.txt");

    assert_eq!(list(&mut fs, "/mnt"), ["a.txt", "b.txt", "c.txt"]);
}

#[test]
fn rewind_restarts_iteration() {
    let (_disk, mut fs) = setup();
    touch(&mut fs, "/mnt/one");
    touch(&mut fs, "/mnt/two");

    let mut dir = fs.open_dir("/mnt").unwrap();
    let first = fs.read_dir(&mut dir).unwrap();
    fs.next_dir(&mut dir).unwrap();
    let second = fs.read_dir(&mut dir).unwrap();
    assert_ne!(first.name, second.name);

    fs.rewind_dir(&mut dir).unwrap();
    let again = fs.read_dir(&mut dir).unwrap();
    assert_eq!(first.name, again.name);
}

#[test]
fn new_directory_is_empty_and_removable() {
    let (disk, mut fs) = setup();
    let free_before = {
        fs.sync("mnt").unwrap();
        fsinfo_free(&disk, 0)
    };

    let mut dir = fs.create_dir("/mnt/d").unwrap();
    // The cursor returned by create_dir is already inside the new
    // directory; the dot stubs are plumbing, not entries.
    assert_eq!(fs.read_dir(&mut dir), Err(FsError::Eof));
    assert_eq!(list(&mut fs, "/mnt/d"), Vec::<String>::new());

    let info = fs.stat("/mnt/d").unwrap();
    assert!(info.is_dir());

    fs.unlink("/mnt/d").unwrap();
    assert_eq!(fs.unlink("/mnt/d"), Err(FsError::Path));
    assert_eq!(fs.stat("/mnt/d"), Err(FsError::Path));

    // mkdir + unlink is free-count neutral.
    assert_eq!(fsinfo_free(&disk, 0), free_before);
    assert_eq!(list(&mut fs, "/mnt"), Vec::<String>::new());
}

#[test]
fn unlink_refuses_nonempty_directory() {
    let (_disk, mut fs) = setup();

    fs.create_dir("/mnt/d").unwrap();
    let mut file = fs.open("/mnt/d/f", CREATE).unwrap();
    fs.close(&mut file).unwrap();

    assert_eq!(fs.unlink("/mnt/d"), Err(FsError::Denied));

    fs.unlink("/mnt/d/f").unwrap();
    fs.unlink("/mnt/d").unwrap();
    assert_eq!(fs.stat("/mnt/d"), Err(FsError::Path));
}

#[test]
fn unlink_of_root_is_denied() {
    let (_disk, mut fs) = setup();
    assert_eq!(fs.unlink("/mnt"), Err(FsError::Denied));
    assert_eq!(fs.unlink("/mnt/"), Err(FsError::Denied));
}

#[test]
fn unlink_respects_protective_attributes() {
    let (disk, mut fs) = setup();
    touch(&mut fs, "/mnt/locked.txt");
    fs.umount("mnt").unwrap();

    // Flip the read-only bit directly on disk.
    let (lba, off) = find_root_sfn(&disk, 0, b"LOCKED").expect("entry on disk");
    let sect = disk.sector(lba);
    disk.patch(lba, off + 11, &[sect[off + 11] | 0x01]);

    let mut fs = Mounts::<SharedDisk>::new();
    fs.mount(disk.clone(), 0, "mnt").unwrap();
    assert_eq!(fs.unlink("/mnt/locked.txt"), Err(FsError::Denied));
}

#[test]
fn nested_directories_resolve() {
    let (_disk, mut fs) = setup();

    fs.create_dir("/mnt/a").unwrap();
    fs.create_dir("/mnt/a/b").unwrap();
    fs.create_dir("/mnt/a/b/c").unwrap();

    let mut file = fs.open("/mnt/a/b/c/deep.txt", CREATE).unwrap();
    fs.write(&mut file, b"deep").unwrap();
    fs.close(&mut file).unwrap();

    assert_eq!(fs.stat("/mnt/a/b/c/deep.txt").unwrap().size, 4);
    assert_eq!(list(&mut fs, "/mnt/a/b"), ["c"]);

    // Trailing slashes are tolerated.
    assert_eq!(list(&mut fs, "/mnt/a/b/"), ["c"]);

    // A file along the way stops the descent.
    assert_eq!(
        fs.stat("/mnt/a/b/c/deep.txt/x"),
        Err(FsError::Path)
    );
}

#[test]
fn long_names_roundtrip_byte_exact() {
    let (_disk, mut fs) = setup();

    let mut name = String::from("/mnt/");
    let long: String = core::iter::repeat('x').take(196).collect::<String>() + ".txt";
    name.push_str(&long);

    touch(&mut fs, &name);
    assert_eq!(list(&mut fs, "/mnt"), [long.clone()]);
    assert_eq!(
        fs.stat(&name).unwrap().name_str().unwrap(),
        long.as_str()
    );

    fs.unlink(&name).unwrap();
    assert_eq!(list(&mut fs, "/mnt"), Vec::<String>::new());
}

#[test]
fn lfn_matching_is_byte_exact() {
    let (_disk, mut fs) = setup();
    touch(&mut fs, "/mnt/MixedCaseName.txt");

    // The long name only matches byte for byte.
    assert_eq!(fs.stat("/mnt/mixedcasename.txt"), Err(FsError::Path));
    assert!(fs.stat("/mnt/MixedCaseName.txt").is_ok());
}

#[test]
fn bare_short_entries_match_case_insensitively() {
    let disk = SharedDisk::new();
    mkfs(&disk);

    // A foreign entry with no LFN group, as another implementation in
    // short-name-only mode would write it.
    let lba = data_lba(0, ROOT_CLUST);
    disk.patch(lba, 0, b"README  TXT");
    disk.patch(lba, 11, &[0x20]);
    disk.patch(lba, 28, &64u32.to_le_bytes());

    let mut fs = Mounts::<SharedDisk>::new();
    fs.mount(disk.clone(), 0, "mnt").unwrap();

    assert_eq!(fs.stat("/mnt/readme.txt").unwrap().size, 64);
    assert_eq!(fs.stat("/mnt/README.TXT").unwrap().size, 64);
    assert_eq!(fs.stat("/mnt/ReAdMe.TxT").unwrap().size, 64);
    assert_eq!(fs.stat("/mnt/readme.md"), Err(FsError::Path));
}

#[test]
fn fourteen_chars_take_two_lfn_slots() {
    let (disk, mut fs) = setup();
    let name = "abcdefghijklmn"; // 14 bytes
    assert_eq!(name.len(), 14);
    touch(&mut fs, &format!("/mnt/{name}"));
    fs.umount("mnt").unwrap();
    assert_eq!(count_root_lfn_slots(&disk, 0), 2);
}

#[test]
fn boundary_name_lengths() {
    let (disk, mut fs) = setup();

    let name13: String = core::iter::repeat('a').take(13).collect();
    touch(&mut fs, &format!("/mnt/{name13}"));
    fs.umount("mnt").unwrap();
    assert_eq!(count_root_lfn_slots(&disk, 0), 1);

    let disk = SharedDisk::new();
    mkfs(&disk);
    let mut fs = Mounts::<SharedDisk>::new();
    fs.mount(disk.clone(), 0, "mnt").unwrap();
    let name255: String = core::iter::repeat('b').take(NAME_MAX).collect();
    touch(&mut fs, &format!("/mnt/{name255}"));
    assert_eq!(list(&mut fs, "/mnt"), [name255.clone()]);
    fs.umount("mnt").unwrap();
    assert_eq!(count_root_lfn_slots(&disk, 0), 20);
}

#[test]
fn overlong_name_is_rejected() {
    let (_disk, mut fs) = setup();
    let name256: String = core::iter::repeat('c').take(NAME_MAX + 1).collect();
    assert!(matches!(
        fs.open(&format!("/mnt/{name256}"), CREATE),
        Err(FsError::Param)
    ));
    assert!(matches!(
        fs.create_dir(&format!("/mnt/{name256}")),
        Err(FsError::Param)
    ));
}

#[test]
fn create_dir_over_existing_entry_is_denied() {
    let (_disk, mut fs) = setup();
    fs.create_dir("/mnt/d").unwrap();
    assert!(matches!(fs.create_dir("/mnt/d"), Err(FsError::Denied)));

    touch(&mut fs, "/mnt/f");
    assert!(matches!(fs.create_dir("/mnt/f"), Err(FsError::Denied)));
}

#[test]
fn dot_stubs_point_home() {
    let (disk, mut fs) = setup();
    fs.create_dir("/mnt/sub").unwrap();
    fs.umount("mnt").unwrap();

    // Find the directory's cluster from its root entry.
    let (lba, off) = find_root_sfn(&disk, 0, b"SUB").expect("entry on disk");
    let sect = disk.sector(lba);
    let hi = u16::from_le_bytes([sect[off + 20], sect[off + 21]]) as u32;
    let lo = u16::from_le_bytes([sect[off + 26], sect[off + 27]]) as u32;
    let clust = hi << 16 | lo;

    let first = disk.sector(data_lba(0, clust));
    assert_eq!(&first[0..11], b".          ");
    assert_eq!(first[11], 0x10);
    let dot_lo = u16::from_le_bytes([first[26], first[27]]) as u32;
    assert_eq!(dot_lo, clust & 0xffff);

    assert_eq!(&first[32..43], b"..         ");
    // Parent is the root, recorded as cluster zero.
    assert_eq!(u16::from_le_bytes([first[32 + 26], first[32 + 27]]), 0);
    // The slot after the stubs terminates the directory.
    assert_eq!(first[64], 0x00);
}

#[test]
fn mirror_copies_stay_identical() {
    let (disk, mut fs) = setup();

    fs.create_dir("/mnt/d").unwrap();
    let mut file = fs.open("/mnt/d/payload", CREATE).unwrap();
    fs.write(&mut file, &stream(11, 40_000)).unwrap();
    fs.close(&mut file).unwrap();
    fs.unlink("/mnt/d/payload").unwrap();
    fs.unlink("/mnt/d").unwrap();
    fs.umount("mnt").unwrap();

    assert_fats_mirrored(&disk, 0);
}

#[test]
fn file_free_count_conservation() {
    let (disk, mut fs) = setup();
    fs.sync("mnt").unwrap();
    let before = fsinfo_free(&disk, 0);

    let mut file = fs.open("/mnt/tmp", CREATE).unwrap();
    fs.write(&mut file, &stream(5, 10_000)).unwrap();
    fs.close(&mut file).unwrap();
    assert!(fsinfo_free(&disk, 0) < before);

    fs.unlink("/mnt/tmp").unwrap();
    assert_eq!(fsinfo_free(&disk, 0), before);
}
