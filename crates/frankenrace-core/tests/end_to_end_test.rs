use frankenrace_core::{CollectingSink, Detector, DetectorConfig, Notification, Tid};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

const BYTE: usize = 100;
const FLAG: usize = 0x1000;

fn detector() -> (Detector, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    (Detector::new(DetectorConfig::default(), sink.clone()), sink)
}

/// Thread A writes a byte and raises a flag; thread B optionally waits on
/// the flag and writes the same byte. Real OS threads, ordered by a channel.
fn flag_scenario(b_acquires: bool) -> Vec<frankenrace_core::RaceReport> {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let a = det.on_thread_create(&mut main, false);
    let b = det.on_thread_create(&mut main, false);
    let (tx, rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let det = &det;
        s.spawn(move || {
            let mut thr = det.on_thread_start(a, 10);
            det.record_access(&mut thr, BYTE, 1, true);
            det.release(&mut thr, FLAG);
            tx.send(()).expect("send");
            det.on_thread_finish(&mut thr);
        });
        s.spawn(move || {
            let mut thr = det.on_thread_start(b, 11);
            rx.recv().expect("recv");
            if b_acquires {
                det.acquire(&mut thr, FLAG);
            }
            det.record_access(&mut thr, BYTE, 1, true);
            det.on_thread_finish(&mut thr);
        });
    });
    det.on_thread_join(&mut main, a);
    det.on_thread_join(&mut main, b);
    sink.races()
}

#[test]
fn flag_release_acquire_orders_the_writes() {
    let races = flag_scenario(true);
    assert!(races.is_empty(), "{races:?}");
}

#[test]
fn missing_acquire_reports_the_write_write_race() {
    let races = flag_scenario(false);
    assert_eq!(races.len(), 1, "{races:?}");
    let race = &races[0];
    assert_eq!(race.addr, BYTE);
    assert!(race.current.is_write && race.previous.is_write);
    assert_ne!(race.current.tid, race.previous.tid);
    assert_eq!(race.current.tid, Tid(2));
    assert_eq!(race.previous.tid, Tid(1));
}

#[test]
fn join_waits_for_a_running_thread() {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    thread::scope(|s| {
        let det = &det;
        s.spawn(move || {
            let mut thr = det.on_thread_start(child, 2);
            for i in 0..64 {
                det.record_access(&mut thr, 0x8000 + i * 8, 8, true);
            }
            det.on_thread_finish(&mut thr);
        });
        // Blocks until the child finishes, then acquires its final clock.
        det.on_thread_join(&mut main, child);
        for i in 0..64 {
            det.record_access(&mut main, 0x8000 + i * 8, 8, true);
        }
    });
    assert!(sink.races().is_empty(), "{:?}", sink.races());
    assert!(sink.diagnostics().is_empty());
}

#[test]
fn thread_misuse_is_diagnosed_not_fatal() {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, true);
    det.on_thread_detach(child);
    det.on_thread_join(&mut main, child);
    det.on_thread_join(&mut main, Tid(40));
    det.on_thread_detach(Tid(41));
    let kinds: Vec<String> = sink
        .diagnostics()
        .iter()
        .map(|d| serde_json::to_value(d).expect("json")["kind"].as_str().unwrap_or("").to_owned())
        .collect();
    assert_eq!(
        kinds,
        ["double_detach", "join_detached_thread", "join_invalid_thread", "detach_invalid_thread"]
    );
}

#[test]
fn user_ids_map_to_live_threads_only() {
    let (det, _) = detector();
    let mut main = det.main_thread(1);
    let tid = det.on_thread_create_for(&mut main, false, 0xdead);
    assert_eq!(det.thread_tid(0xdead), Some(tid));
    det.set_thread_name(tid, "worker");
    let mut thr = det.on_thread_start(tid, 7);
    assert_eq!(det.thread_info(tid).and_then(|i| i.name), Some("worker".to_owned()));
    det.on_thread_finish(&mut thr);
    det.on_thread_join(&mut main, tid);
    assert_eq!(det.thread_tid(0xdead), None);
}

#[test]
fn stack_ranges_classify_race_locations() {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    let mut t1 = det.on_thread_start(child, 2);
    det.set_thread_ranges(child, Some(0x7000_0000..0x7001_0000), Some(0x7100_0000..0x7100_1000));

    det.record_access(&mut t1, 0x7000_0100, 8, true);
    det.record_access(&mut main, 0x7000_0100, 8, false);
    det.record_access(&mut t1, 0x7100_0010, 4, true);
    det.record_access(&mut main, 0x7100_0010, 4, true);
    let locations: Vec<_> = sink.races().into_iter().map(|r| r.location).collect();
    assert_eq!(
        locations,
        [
            frankenrace_core::Location::Stack { tid: child },
            frankenrace_core::Location::Tls { tid: child },
        ]
    );
}

#[test]
fn shadow_stack_is_attached_to_reports() {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    let mut t1 = det.on_thread_start(child, 2);
    det.record_access(&mut main, 0x9000, 8, true);
    t1.func_entry(0x40_1000);
    t1.func_entry(0x40_2000);
    det.record_access(&mut t1, 0x9000, 8, true);
    t1.func_exit();
    let race = sink.races().pop().expect("race");
    assert_eq!(&*det.stacks().get(race.current.stack), &[0x40_1000, 0x40_2000]);
    assert_eq!(t1.stack_frames(), &[0x40_1000]);
}

#[test]
fn ignore_scopes_suppress_recording() {
    let (det, sink) = detector();
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    let mut t1 = det.on_thread_start(child, 2);
    det.record_access(&mut main, 0xa000, 8, true);
    t1.ignore_begin();
    t1.ignore_begin();
    det.record_access(&mut t1, 0xa000, 8, true);
    t1.ignore_end();
    det.record_access(&mut t1, 0xa000, 8, true);
    assert!(sink.races().is_empty(), "still nested once");
    t1.ignore_end();
    det.record_access(&mut t1, 0xa000, 8, true);
    assert_eq!(sink.races().len(), 1);
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn recording_handler(det: &Detector) -> Arc<Mutex<Vec<(Tid, Notification)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    det.set_notification_handler(Some(Arc::new(move |tid, n| sink.lock().push((tid, n)))));
    seen
}

#[test]
fn self_notification_outside_blocking_runs_immediately() {
    let (det, _) = detector();
    let seen = recording_handler(&det);
    let mut main = det.main_thread(1);
    let n = Notification { signo: 10, payload: 1 };
    det.deliver(Some(&mut main), Tid::MAIN, n);
    assert_eq!(*seen.lock(), [(Tid::MAIN, n)]);
    assert_eq!(det.metrics().notifications_queued, 0);
    assert_eq!(det.metrics().notifications_processed, 1);
}

#[test]
fn notifications_during_a_blocking_call_are_deferred() {
    let (det, _) = detector();
    let seen = recording_handler(&det);
    let mut main = det.main_thread(1);
    let first = Notification { signo: 2, payload: 1 };
    let dup = Notification { signo: 2, payload: 2 };
    {
        let mut call = det.blocking_call(&mut main);
        det.deliver(Some(call.state()), Tid::MAIN, first);
        det.deliver(None, Tid::MAIN, dup);
        assert!(seen.lock().is_empty(), "nothing runs inside the blocking call");
    }
    assert_eq!(*seen.lock(), [(Tid::MAIN, first)], "the duplicate was dropped");
    assert_eq!(det.metrics().notifications_queued, 1);
}

#[test]
fn handling_a_notification_acquires_every_thread() {
    let (det, sink) = detector();
    let seen = recording_handler(&det);
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    let mut t1 = det.on_thread_start(child, 2);

    det.record_access(&mut main, 0xb000, 8, true);
    det.deliver(Some(&mut main), child, Notification { signo: 15, payload: 0 });
    assert!(seen.lock().is_empty(), "another thread's notification is queued");

    det.process_pending(&mut t1);
    assert_eq!(seen.lock().len(), 1);
    det.record_access(&mut t1, 0xb000, 8, true);
    assert!(sink.races().is_empty(), "{:?}", sink.races());
}
