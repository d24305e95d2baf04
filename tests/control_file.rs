//! Control file durability: round-trips, cursor monotonicity across
//! reopens, and lock exclusivity between concurrent drivers.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use uuid::Uuid;

use replog::server::{ActiveTransactions, ControlFile, control_file_path, read_control_file};

fn guid() -> Uuid {
    Uuid::from_bytes([4u8; 16])
}

#[test]
fn save_complete_roundtrips_through_reopen() {
    let dir = TempDir::new().unwrap();
    let mut txns = ActiveTransactions::new();

    {
        let mut control = ControlFile::open(dir.path(), &guid(), 0, &mut txns).unwrap();
        txns.insert(100, 11);
        txns.insert(200, 12);
        control.save_complete(12, &txns).unwrap();
    }

    let snapshot = read_control_file(&control_file_path(dir.path(), &guid())).unwrap();
    assert_eq!(snapshot.sequence, 12);
    assert_eq!(snapshot.offset, 0);
    assert_eq!(snapshot.transactions, txns);

    // Reopening hands the same state back and ignores the hint.
    let mut reloaded = ActiveTransactions::new();
    let control = ControlFile::open(dir.path(), &guid(), 99, &mut reloaded).unwrap();
    assert_eq!(control.sequence(), 12);
    assert_eq!(reloaded, txns);
}

#[test]
fn cursor_is_monotonic_across_reopens() {
    let dir = TempDir::new().unwrap();

    {
        let mut txns = ActiveTransactions::new();
        let mut control = ControlFile::open(dir.path(), &guid(), 0, &mut txns).unwrap();
        control.save_complete(8, &txns).unwrap();
    }

    {
        let mut txns = ActiveTransactions::new();
        let mut control = ControlFile::open(dir.path(), &guid(), 3, &mut txns).unwrap();
        assert_eq!(control.sequence(), 8, "hint never rewinds an existing cursor");
        control.save_complete(5, &txns).unwrap();
        control.save_partial(8, 10, &txns).unwrap();
        control.save_partial(8, 4, &txns).unwrap();
    }

    let snapshot = read_control_file(&control_file_path(dir.path(), &guid())).unwrap();
    assert_eq!(snapshot.sequence, 8);
    assert_eq!(snapshot.offset, 10);
}

#[test]
fn concurrent_open_blocks_until_lock_released() {
    let dir = TempDir::new().unwrap();
    let mut txns = ActiveTransactions::new();
    let control = ControlFile::open(dir.path(), &guid(), 1, &mut txns).unwrap();

    let directory = dir.path().to_path_buf();
    let (started_tx, started_rx) = mpsc::channel();

    let contender = thread::spawn(move || {
        started_tx.send(()).unwrap();
        let begun = Instant::now();
        let mut txns = ActiveTransactions::new();
        let control = ControlFile::open(&directory, &guid(), 1, &mut txns).unwrap();
        (begun.elapsed(), control.sequence())
    });

    started_rx.recv().unwrap();
    let hold = Duration::from_millis(400);
    thread::sleep(hold);
    drop(control);

    let (waited, sequence) = contender.join().unwrap();
    assert!(
        waited >= hold - Duration::from_millis(100),
        "second open returned after {waited:?}, before the lock was released"
    );
    assert_eq!(sequence, 0, "contender sees consistent state, not garbage");
}

#[test]
fn stale_checkpoints_do_not_clobber_newer_state() {
    let dir = TempDir::new().unwrap();
    let mut txns = ActiveTransactions::new();
    let mut control = ControlFile::open(dir.path(), &guid(), 0, &mut txns).unwrap();

    txns.insert(1, 6);
    control.save_partial(6, 500, &txns).unwrap();
    txns.remove(1);
    control.save_complete(6, &txns).unwrap();

    // A replayer re-walking an older segment must not move the cursor
    // backwards.
    txns.insert(1, 5);
    control.save_partial(5, 100, &txns).unwrap();
    control.save_complete(4, &txns).unwrap();
    drop(control);

    let snapshot = read_control_file(&control_file_path(dir.path(), &guid())).unwrap();
    assert_eq!(snapshot.sequence, 6);
    assert_eq!(snapshot.offset, 0);
    assert!(snapshot.transactions.is_empty());
}
