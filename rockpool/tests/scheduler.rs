//! Runnable queue tests: FIFO ordering, inlining and the blocking wait.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use rockpool::SimMultiplexer;

#[test]
fn runnables_execute_in_fifo_order() {
    let mux = SimMultiplexer::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let log = Arc::clone(&log);
        mux.schedule(move || log.lock().unwrap().push(i));
    }
    assert_eq!(mux.runnables().len(), 5);

    assert_eq!(mux.drain(), 5);
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn try_run_once_reports_an_empty_queue() {
    let mux = SimMultiplexer::new();
    assert!(!mux.try_run_once());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    mux.schedule(move || flag.store(true, Ordering::SeqCst));
    assert!(mux.try_run_once());
    assert!(ran.load(Ordering::SeqCst));
    assert!(!mux.try_run_once());
}

#[test]
fn inlined_runnables_bypass_the_queue() {
    let mux = SimMultiplexer::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    mux.inline_next_runnables(2);
    {
        let log = Arc::clone(&log);
        mux.after_next_inlined_runnable(move || log.lock().unwrap().push("callback"));
    }
    for name in ["first", "second"] {
        let log = Arc::clone(&log);
        mux.schedule(move || log.lock().unwrap().push(name));
    }

    // Both units ran synchronously; the one-shot callback fired after the
    // second one and the queue stayed empty.
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "callback"]);
    assert!(mux.runnables().is_empty());

    // The budget is exhausted, so the next unit queues normally and the
    // callback does not fire again.
    {
        let log = Arc::clone(&log);
        mux.schedule(move || log.lock().unwrap().push("third"));
    }
    assert_eq!(mux.runnables().len(), 1);
    assert_eq!(mux.drain(), 1);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["first", "second", "callback", "third"]
    );
}

#[test]
fn reset_inlining_restores_queueing() {
    let mux = SimMultiplexer::new();
    mux.inline_next_runnables(10);
    mux.reset_inlining();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    mux.schedule(move || flag.store(true, Ordering::SeqCst));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(mux.drain(), 1);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn blocking_run_once_waits_for_a_producer() {
    let mux = SimMultiplexer::new();
    let queue = mux.runnables();
    let delivered = Arc::new(AtomicBool::new(false));

    let producer = {
        let flag = Arc::clone(&delivered);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            queue.schedule(Box::new(move || flag.store(true, Ordering::SeqCst)));
        })
    };

    // Blocks on the condition variable until the producer schedules.
    mux.run_once();
    assert!(delivered.load(Ordering::SeqCst));
    producer.join().unwrap();
}
