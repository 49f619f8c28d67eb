mod common;

use common::{init_logger, mounted_fs, remounted_fs, RamFlash};
use norfs::{Error, FileSystem, OpenFlags, SECTORS, SECTOR_SIZE, TABLE_COUNT};

const DATA_SECTORS: usize = SECTORS - TABLE_COUNT;

fn write_file(fs: &FileSystem<&mut RamFlash>, name: &str, content: &[u8]) {
    let mut file = fs.open_file(name, OpenFlags::WRITE).expect("open for write");
    file.write(content).expect("write");
    file.close().expect("close");
}

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

fn delete_file(fs: &FileSystem<&mut RamFlash>, name: &str) {
    // Replacing a file with nothing removes it: no sector is allocated, so
    // no header is written, and the old chain is retired at close.
    let file = fs.open_file(name, OpenFlags::WRITE).expect("open for delete");
    file.close().expect("close");
}

#[test]
fn test_delete_by_empty_replacement() {
    init_logger();
    let mut flash = RamFlash::new();
    let fs = mounted_fs(&mut flash);
    write_file(&fs, "gone", b"short lived");
    delete_file(&fs, "gone");
    assert!(matches!(
        fs.open_file("gone", OpenFlags::READ),
        Err(Error::NotFound)
    ));
    let info = fs.info().expect("info");
    assert_eq!(info.file_count(), 0);
    assert_eq!(info.bytes_uncollected(), SECTOR_SIZE as u32);
    // Not collected until an allocation actually runs dry.
    assert_eq!(info.garbage_count(), 0);
}

/// A writer that fills the volume far enough to force a garbage collection
/// mid-write commits its partial chain as a side effect. If power is lost
/// before close, the remount must discard that chain and a later collection
/// must reuse its sectors.
#[test]
fn test_orphan_chain_swept_on_mount() {
    init_logger();
    let mut flash = RamFlash::new();
    // One byte more than 251 sectors can hold once the header page is
    // taken, so the write needs every data sector on the volume.
    let big_len = (DATA_SECTORS - 1) * SECTOR_SIZE - 256 + 1;
    let content: Vec<u8> = (0..big_len).map(|i| (i % 251) as u8).collect();
    {
        let fs = mounted_fs(&mut flash);
        write_file(&fs, "seed", b"to be deleted");
        delete_file(&fs, "seed");

        let mut big = fs.open_file("big", OpenFlags::WRITE).expect("open");
        // The last allocation runs out of free sectors, collects the dead
        // seed sector and force-rotates the tables, persisting the chain
        // written so far with its write bit still set.
        big.write(&content).expect("write");
        let info = fs.info().expect("info");
        assert_eq!(info.garbage_count(), 1);
        assert_eq!(info.swap_count(), 1);
        // Power cut: the handle is never closed.
        drop(big);
    }
    let fs = remounted_fs(&mut flash);
    let info = fs.info().expect("info");
    assert_eq!(info.file_count(), 0);
    assert_eq!(info.bytes_available(), SECTOR_SIZE as u32);
    assert_eq!(
        info.bytes_uncollected(),
        ((DATA_SECTORS - 1) * SECTOR_SIZE) as u32
    );
    // The swept sectors are reclaimable: this write needs two of them.
    let after = vec![0x77u8; 5000];
    write_file(&fs, "after", &after);
    assert_eq!(read_all(&fs, "after"), after);
    let info = fs.info().expect("info");
    assert_eq!(info.file_count(), 1);
    assert_eq!(info.garbage_count(), 2);
    assert_eq!(
        info.bytes_available(),
        ((DATA_SECTORS - 2) * SECTOR_SIZE) as u32
    );
    assert_eq!(info.bytes_uncollected(), 0);
}

#[test]
fn test_full_volume_fails_and_recovers() {
    init_logger();
    let mut flash = RamFlash::new();
    let fs = mounted_fs(&mut flash);
    for i in 0..DATA_SECTORS {
        write_file(&fs, &format!("f{}", i), &[i as u8; 100]);
    }
    assert_eq!(fs.info().expect("info").bytes_available(), 0);

    // Nothing dead to collect: the volume is genuinely full.
    let mut file = fs.open_file("g", OpenFlags::WRITE).expect("open");
    assert!(matches!(file.write(b"overflow"), Err(Error::NotEnoughSpace)));
    assert!(matches!(file.close(), Err(Error::NotEnoughSpace)));
    assert_eq!(fs.info().expect("info").garbage_count(), 0);

    // Existing data is untouched.
    assert_eq!(read_all(&fs, "f7"), vec![7u8; 100]);

    // Deleting one file makes room again, via a collection pass.
    delete_file(&fs, "f7");
    assert!(matches!(
        fs.open_file("f7", OpenFlags::READ),
        Err(Error::NotFound)
    ));
    write_file(&fs, "g", b"fits now");
    assert_eq!(read_all(&fs, "g"), b"fits now");
    let info = fs.info().expect("info");
    assert_eq!(info.garbage_count(), 1);
    assert_eq!(info.file_count(), DATA_SECTORS as u32);
}
