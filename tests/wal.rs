//! Write-ahead log: checksums, index lookups, snapshots and restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tempfile::{tempdir, TempDir};
use udb::storage::DbFile;
use udb::wal::format::checksum;
use udb::wal::{Wal, WalIndex, WalShared};
use udb::{Error, PageNo};

const PS: usize = 512;

fn setup() -> (TempDir, Arc<WalShared>, DbFile) {
    let dir = tempdir().unwrap();
    let shared = Arc::new(WalShared::open(dir.path().join("t.db-wal"), PS).unwrap());
    let db = DbFile::open(dir.path().join("t.db"), PS).unwrap();
    (dir, shared, db)
}

fn commit(wal: &mut Wal, page: u32, fill: u8, db_size: u32) {
    wal.begin_read_transaction().unwrap();
    wal.begin_write_transaction().unwrap();
    let image = vec![fill; PS];
    wal.write_frames(&[(PageNo::new(page), &image)], Some(db_size)).unwrap();
    wal.end_read_transaction();
}

fn read_first_byte(wal: &Wal, page: u32) -> Option<u8> {
    let frame = wal.find_frame(PageNo::new(page)).unwrap()?;
    let mut buf = vec![0u8; PS];
    wal.read_frame(frame, &mut buf).unwrap();
    Some(buf[0])
}

#[test]
fn test_old_snapshot_keeps_frame_across_checkpoint() {
    let (_dir, shared, mut db) = setup();
    let mut writer = Wal::new(Arc::clone(&shared), None);
    commit(&mut writer, 5, 0x01, 5);

    let mut old = Wal::new(Arc::clone(&shared), None);
    old.begin_read_transaction().unwrap();
    let old_frame = old.find_frame(PageNo::new(5)).unwrap();
    assert_eq!(old_frame, Some(1));

    let mut ckpt = Wal::new(Arc::clone(&shared), None);
    ckpt.checkpoint(&mut db).unwrap();
    assert_eq!(shared.backfill(), 1);

    // The open reader pins a read mark, so the log cannot restart.
    let salts = shared.header().salt;
    commit(&mut writer, 5, 0x02, 5);
    assert_eq!(shared.header().salt, salts);
    assert_eq!(shared.header().max_frame, 2);

    let mut new = Wal::new(Arc::clone(&shared), None);
    new.begin_read_transaction().unwrap();
    assert_eq!(old.find_frame(PageNo::new(5)).unwrap(), Some(1));
    assert_eq!(read_first_byte(&old, 5), Some(0x01));
    assert_eq!(new.find_frame(PageNo::new(5)).unwrap(), Some(2));
    assert_eq!(read_first_byte(&new, 5), Some(0x02));
}

#[test]
fn test_restart_changes_salts_and_hides_stale_frames() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("t.db-wal");
    let mut db = DbFile::open(dir.path().join("t.db"), PS).unwrap();
    let shared = Arc::new(WalShared::open(&wal_path, PS).unwrap());

    let mut writer = Wal::new(Arc::clone(&shared), None);
    commit(&mut writer, 5, 0x01, 5);
    commit(&mut writer, 5, 0x02, 5);
    let first_salts = shared.header().salt;

    let result = writer.checkpoint(&mut db).unwrap();
    assert_eq!(result.backfilled, 2);

    commit(&mut writer, 5, 0x03, 5);
    let header = shared.header();
    assert_ne!(header.salt, first_salts);
    assert_eq!(header.max_frame, 1);

    let mut reader = Wal::new(Arc::clone(&shared), None);
    reader.begin_read_transaction().unwrap();
    assert_eq!(reader.find_frame(PageNo::new(5)).unwrap(), Some(1));
    assert_eq!(read_first_byte(&reader, 5), Some(0x03));
    drop(reader);
    drop(writer);
    drop(shared);

    // Frame 2 of the previous generation is still on disk but carries the
    // old salts, so recovery stops after frame 1.
    let reopened = Arc::new(WalShared::open(&wal_path, PS).unwrap());
    assert_eq!(reopened.header().max_frame, 1);
    assert_eq!(reopened.header().salt, header.salt);
    let mut reader = Wal::new(reopened, None);
    reader.begin_read_transaction().unwrap();
    assert_eq!(read_first_byte(&reader, 5), Some(0x03));
}

#[test]
fn test_writer_busy_until_snapshot_refreshed() {
    let (_dir, shared, _db) = setup();
    let mut a = Wal::new(Arc::clone(&shared), None);
    let mut b = Wal::new(Arc::clone(&shared), None);
    b.begin_read_transaction().unwrap();

    commit(&mut a, 1, 0x10, 1);
    assert!(matches!(b.begin_write_transaction(), Err(Error::Busy)));
}

#[test]
fn test_concurrent_readers_see_stable_snapshots() {
    let (_dir, shared, _db) = setup();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut wal = Wal::new(shared, None);
                let mut last_seen = 0u8;
                while !done.load(Ordering::Acquire) {
                    wal.begin_read_transaction().unwrap();
                    let first = read_first_byte(&wal, 1).unwrap_or(0);
                    thread::yield_now();
                    let second = read_first_byte(&wal, 1).unwrap_or(0);
                    wal.end_read_transaction();

                    assert_eq!(first, second, "snapshot changed under a reader");
                    assert!(first >= last_seen, "snapshot went backwards");
                    last_seen = first;
                }
            })
        })
        .collect();

    let mut writer = Wal::new(Arc::clone(&shared), None);
    for fill in 1..=100u8 {
        commit(&mut writer, 1, fill, 1);
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    let mut wal = Wal::new(shared, None);
    wal.begin_read_transaction().unwrap();
    assert_eq!(read_first_byte(&wal, 1), Some(100));
}

// ============================================================================
// Property tests
// ============================================================================

proptest! {
    #[test]
    fn prop_checksum_chains(
        a in prop::collection::vec(any::<u64>(), 0..32),
        b in prop::collection::vec(any::<u64>(), 0..32),
        seed in any::<(u32, u32)>(),
        big_endian in any::<bool>(),
    ) {
        let a: Vec<u8> = a.iter().flat_map(|w| w.to_le_bytes()).collect();
        let b: Vec<u8> = b.iter().flat_map(|w| w.to_le_bytes()).collect();
        let whole: Vec<u8> = a.iter().chain(&b).copied().collect();

        let chained = checksum(&b, checksum(&a, seed, big_endian), big_endian);
        prop_assert_eq!(checksum(&whole, seed, big_endian), chained);
    }

    #[test]
    fn prop_checksum_detects_bit_flip(
        words in prop::collection::vec(any::<u64>(), 1..64),
        bit in any::<usize>(),
        big_endian in any::<bool>(),
    ) {
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut flipped = data.clone();
        let bit = bit % (data.len() * 8);
        flipped[bit / 8] ^= 1 << (bit % 8);

        prop_assert_ne!(
            checksum(&data, (0, 0), big_endian),
            checksum(&flipped, (0, 0), big_endian)
        );
    }

    /// Index lookups agree with a linear scan of the frame list.
    #[test]
    fn prop_find_frame_matches_scan(
        pages in prop::collection::vec(1u32..24, 1..120),
        queries in prop::collection::vec((1u32..26, 0u32..130, 0u32..130), 1..40),
    ) {
        let mut index = WalIndex::with_block_size(16);
        for (i, &page) in pages.iter().enumerate() {
            index.append(i as u32 + 1, page).unwrap();
        }

        for (page, a, b) in queries {
            let (min_frame, max_frame) = (a.min(b), a.max(b));
            let max_frame = max_frame.min(pages.len() as u32);
            let expected = (min_frame.max(1)..=max_frame)
                .rev()
                .find(|&f| pages[f as usize - 1] == page);
            prop_assert_eq!(index.find_frame(page, min_frame, max_frame).unwrap(), expected);
        }
    }
}
