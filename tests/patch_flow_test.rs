//! Integration tests for the scan -> consolidate -> apply pipeline
//!
//! Run with: cargo test --test patch_flow_test -- --nocapture

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use autopatch::app::{CommandTable, Invocation, Session, SessionConfig};
use autopatch::db::{RecordDb, RecordFile};
use autopatch::debug::sim::{SimPatchDb, SimTarget};
use autopatch::debug::{ProcessStart, RawPatchedByte, SessionFlags, INVALID_FILE_OFFSET};
use autopatch::engine::{poll_once, Applicator, GateState, LifecycleGate, PollOutcome, Poller, PollerConfig};
use autopatch::patch::{consolidate, scan_static_patches, PatchCache, PatchRegion, PatchSnapshot};

fn start_event(entry: u64) -> ProcessStart {
    ProcessStart {
        pid: 1234,
        thread_id: 1234,
        entry_address: entry,
        image_name: "demo".into(),
        base: 0x1000,
        size: 0x4000,
    }
}

fn scanned_cache(db: &SimPatchDb) -> Arc<PatchCache> {
    let cache = Arc::new(PatchCache::new());
    let outcome = poll_once(&cache, db, &SessionFlags::new());
    assert!(matches!(outcome, PollOutcome::Refreshed { .. }));
    cache
}

#[test]
fn test_end_to_end_process_start() {
    let db = SimPatchDb::new();
    db.patch(0x1000, &[0xAA, 0xBB, 0xCC, 0xDD], &[0x11, 0x22, 0x33, 0x44]);
    let cache = scanned_cache(&db);

    let mut gate = LifecycleGate::new(Applicator::new(cache, true));
    let mut target = SimTarget::new().with_memory(0x1000, &[0xAA, 0xBB, 0xCC, 0xDD]);
    // Prime the host view so invalidation is observable
    assert_eq!(target.read_view(0x1002), Some(0xCC));

    let outcome = gate.on_process_start(&start_event(0x1000), &mut target);

    assert!(outcome.suspended);
    assert_eq!(outcome.regions_applied(), 1);
    assert_eq!(outcome.bytes_written(), 4);
    assert_eq!(
        target.peek_range(0x1000, 4),
        vec![Some(0x11), Some(0x22), Some(0x33), Some(0x44)]
    );
    assert_eq!(target.read_view(0x1002), Some(0x33));
    assert_eq!(target.suspend_calls(), 1);
    assert_eq!(target.resume_calls(), 1);
    assert_eq!(gate.state(), GateState::Running);
}

#[test]
fn test_apply_is_idempotent() {
    let db = SimPatchDb::new();
    db.patch(0x1000, &[0xAA, 0xBB], &[0x11, 0x22]);
    db.patch(0x2000, &[0x74], &[0xEB]);
    let cache = scanned_cache(&db);

    let mut gate = LifecycleGate::new(Applicator::new(cache, true));
    let mut target = SimTarget::new()
        .with_memory(0x1000, &[0xAA, 0xBB])
        .with_memory(0x2000, &[0x74]);

    gate.on_process_start(&start_event(0x1000), &mut target);
    let first = target.memory().clone();
    let again = gate.on_process_start(&start_event(0x1000), &mut target);

    assert_eq!(again.bytes_written(), 3);
    assert_eq!(target.memory(), &first);
    assert_eq!(gate.starts(), 2);
}

#[test]
fn test_apply_pass_uses_one_snapshot() {
    let db = SimPatchDb::new();
    db.patch(0x10, &[0, 0], &[1, 2]);
    db.patch(0x40, &[0], &[3]);
    let cache = scanned_cache(&db);

    // Swap in a different snapshot after the first write of the pass
    let swapper = Arc::clone(&cache);
    let swapped = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&swapped);
    let mut target = SimTarget::new().on_write(Box::new(move |_, _| {
        let mut done = flag.lock().unwrap();
        if !*done {
            *done = true;
            swapper.write(PatchSnapshot::new(vec![
                PatchRegion::new(0x90, vec![0], vec![9]).unwrap()
            ]));
        }
    }));
    target.flags().set_busy(false);

    let report = Applicator::new(Arc::clone(&cache), true)
        .apply_all(&mut target)
        .unwrap();

    assert!(*swapped.lock().unwrap());
    assert_eq!(report.bytes_written, 3);
    assert_eq!(target.peek_range(0x10, 2), vec![Some(1), Some(2)]);
    assert_eq!(target.peek(0x40), Some(3));
    assert_eq!(target.peek(0x90), None);
    assert_eq!(cache.read().regions()[0].start_address(), 0x90);
}

#[test]
fn test_suspend_failure_leaves_memory_untouched() {
    let db = SimPatchDb::new();
    db.patch(0x1000, &[0xAA], &[0x11]);
    let mut gate = LifecycleGate::new(Applicator::new(scanned_cache(&db), true));
    let mut target = SimTarget::new().with_memory(0x1000, &[0xAA]).fail_suspend();

    let outcome = gate.on_process_start(&start_event(0x1000), &mut target);

    assert!(!outcome.suspended);
    assert!(outcome.result.is_none());
    assert_eq!(target.peek(0x1000), Some(0xAA));
    assert_eq!(target.write_calls(), 0);
    assert_eq!(target.resume_calls(), 1);
    assert_eq!(gate.state(), GateState::Running);
}

#[test]
fn test_invalid_offset_splits_run() {
    let db = SimPatchDb::new();
    for (address, file_offset) in [(0x10, 0x10), (0x11, INVALID_FILE_OFFSET), (0x12, 0x12)] {
        db.push_raw(RawPatchedByte {
            address,
            file_offset,
            original: 0,
            patched: 0xFF,
        });
    }

    let outcome = scan_static_patches(&db).unwrap();
    assert_eq!(outcome.skipped, 1);

    let regions = consolidate(&outcome.edits);
    let spans: Vec<(u64, usize)> = regions.iter().map(|r| (r.start_address(), r.len())).collect();
    assert_eq!(spans, vec![(0x10, 1), (0x12, 1)]);
}

#[test]
fn test_repeated_address_is_ignored() {
    let db = SimPatchDb::new();
    db.push_raw(RawPatchedByte { address: 0x20, file_offset: 0x20, original: 1, patched: 2 });
    db.push_raw(RawPatchedByte { address: 0x20, file_offset: 0x20, original: 1, patched: 9 });
    db.push_raw(RawPatchedByte { address: 0x21, file_offset: 0x21, original: 1, patched: 3 });

    let outcome = scan_static_patches(&db).unwrap();
    assert_eq!(outcome.duplicates, 1);

    let regions = consolidate(&outcome.edits);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].patched_bytes(), &[2, 3]);
}

#[test]
fn test_poller_kill_is_prompt() {
    let cache = Arc::new(PatchCache::new());
    let interval = Duration::from_millis(700);
    let mut handle = Poller::spawn(
        PollerConfig {
            name: "PatchMonitoring".into(),
            interval,
        },
        Arc::clone(&cache),
        Arc::new(SimPatchDb::new()),
        Arc::new(SessionFlags::new()),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    handle.kill();

    assert!(started.elapsed() < interval);
    assert!(!handle.is_running());
    assert!(cache.try_begin_refresh().is_some());
}

#[test]
fn test_record_file_session() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("patches.json");
    let mut file = RecordFile::default();
    file.push(0x1000, &[0xAA, 0xBB, 0xCC, 0xDD], &[0x11, 0x22, 0x33, 0x44]);
    file.write_to(&records).unwrap();

    let mut config = SessionConfig::new(dir.path().join("settings.json"));
    config.background_poll = false;
    let mut session = Session::start(
        config,
        Arc::new(RecordDb::new(&records, None)),
        Arc::new(SessionFlags::new()),
    )
    .unwrap();
    assert_eq!(session.snapshot().total_bytes(), 4);

    // Edits to the record file show up on the next scan
    file.push(0x3000, &[0x74], &[0xEB]);
    file.write_to(&records).unwrap();
    let table = CommandTable::new();
    table
        .execute(&mut session, "rescan", Invocation { arg: None, target: None })
        .unwrap();
    assert_eq!(session.snapshot().len(), 2);

    let mut target = SimTarget::new()
        .with_memory(0x1000, &[0xAA, 0xBB, 0xCC, 0xDD])
        .with_memory(0x3000, &[0x74]);
    let outcome = session.on_process_start(&start_event(0x1000), &mut target);
    assert_eq!(outcome.bytes_written(), 5);
    assert_eq!(target.peek(0x3000), Some(0xEB));

    session.on_process_exit();
    assert_eq!(session.gate().state(), GateState::Detached);
}
