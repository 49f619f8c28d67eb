mod common;

use common::{init_logger, mounted_fs, remounted_fs, RamFlash};
use norfs::{Error, FileSystem, FsOptions, OpenFlags, SECTOR_SIZE};

const OLD_CONTENT: &[u8] = b"old contents, version 1";
const NEW_CONTENT: &[u8] = b"NEW CONTENTS! version 2, somewhat longer than before";

fn read_all(fs: &FileSystem<&mut RamFlash>, name: &str) -> Vec<u8> {
    let mut file = fs.open_file(name, OpenFlags::READ).expect("open for read");
    let mut content = vec![0u8; file.len() as usize];
    let mut done = 0;
    while done < content.len() {
        let n = file.read(&mut content[done..]).expect("read");
        assert!(n > 0, "short read");
        done += n;
    }
    content
}

/// Replays a file replacement, cutting the power (failing all writes) after
/// every possible number of flash operations. Whatever the cut point, a
/// remount must succeed and show either the complete old version or the
/// complete new one, never a torn mix; once close reports success the new
/// version must be the one visible.
#[test]
fn test_interrupted_replace_keeps_old_version() {
    init_logger();
    let baseline = {
        let mut flash = RamFlash::new();
        {
            let fs = mounted_fs(&mut flash);
            let mut file = fs.open_file("cfg", OpenFlags::WRITE).expect("open");
            file.write(OLD_CONTENT).expect("write");
            file.close().expect("close");
        }
        flash.mem
    };

    let mut completed = false;
    for cut in 0..64 {
        let mut flash = RamFlash::from_mem(baseline.clone());
        flash.fail_after(cut);
        let closed_ok = {
            let fs = remounted_fs(&mut flash);
            let mut file = fs.open_file("cfg", OpenFlags::WRITE).expect("open");
            let _ = file.write(NEW_CONTENT);
            file.close().is_ok()
        };
        flash.clear_failure();
        // The volume must mount no matter where the cut landed.
        let fs = remounted_fs(&mut flash);
        let got = read_all(&fs, "cfg");
        assert!(
            got == OLD_CONTENT || got == NEW_CONTENT,
            "torn content after cut at {} operations",
            cut
        );
        if closed_ok {
            // The close committed, so the new version must be visible.
            assert_eq!(got, NEW_CONTENT, "cut after {} operations", cut);
            completed = true;
            break;
        }
    }
    assert!(completed, "replacement never ran to completion");
}

#[test]
fn test_single_bit_flip_falls_back_to_secondary() {
    init_logger();
    let mut flash = RamFlash::new();
    let before = {
        let fs = mounted_fs(&mut flash);
        let mut file = fs.open_file("cfg", OpenFlags::WRITE).expect("open");
        file.write(OLD_CONTENT).expect("write");
        file.close().expect("close");
        fs.info().expect("info")
    };
    // One bad bit in the primary table's descriptor area.
    flash.mem[600] ^= 0x01;
    let fs = remounted_fs(&mut flash);
    assert_eq!(fs.info().expect("info"), before);
    assert_eq!(read_all(&fs, "cfg"), OLD_CONTENT);
}

#[test]
fn test_corrupt_pair_fails_mount() {
    init_logger();
    let mut flash = RamFlash::new();
    {
        let fs = mounted_fs(&mut flash);
        let mut file = fs.open_file("cfg", OpenFlags::WRITE).expect("open");
        file.write(OLD_CONTENT).expect("write");
        file.close().expect("close");
    }
    flash.mem[600] ^= 0x01;
    flash.mem[SECTOR_SIZE + 601] ^= 0x01;
    let fs = FileSystem::new(&mut flash, FsOptions::new());
    assert!(matches!(fs.mount(), Err(Error::CrcMismatch)));
}

/// Flipping a byte anywhere in a table sector must fail its validation:
/// in the commit ring (used, blank or torn slots), the descriptors, the
/// counters or the padding.
#[test]
fn test_crc_detects_flips_across_the_sector() {
    init_logger();
    for offset in [0usize, 3, 96, 100, 504, 1000, 1529, 4095] {
        let mut flash = RamFlash::new();
        {
            let fs = FileSystem::new(&mut flash, FsOptions::new());
            fs.format().expect("format");
        }
        flash.mem[offset] ^= 0x10;
        flash.mem[SECTOR_SIZE + offset] ^= 0x10;
        let fs = FileSystem::new(&mut flash, FsOptions::new());
        assert!(
            matches!(fs.mount(), Err(Error::CrcMismatch)),
            "flip at offset {} went undetected",
            offset
        );
    }
}

#[test]
fn test_device_error_propagates() {
    init_logger();
    let mut flash = RamFlash::new();
    // Formatting blank flash costs exactly two page programs; every
    // mutating operation after those fails.
    flash.fail_after(2);
    let fs = FileSystem::new(&mut flash, FsOptions::new());
    fs.format().expect("format");
    fs.mount().expect("mount");
    let mut file = fs.open_file("doomed", OpenFlags::WRITE).expect("open");
    assert!(matches!(file.write(b"payload"), Err(Error::Io(_))));
    assert!(matches!(file.close(), Err(Error::Io(_))));
}
