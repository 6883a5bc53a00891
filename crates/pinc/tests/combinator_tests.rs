//! Combinator tests
//!
//! Covers the task combinators running on a real runtime:
//! - `wait_until` timeouts and cancellation of the loser
//! - `gather` failure semantics
//! - `wait_for` with `Event` and `Condition`
//! - `to_thread` eager submission
//! - The blocking `sync` bridge and `Future` single assignment

use pinc::{
    gather, sleep, sync, to_thread, wait_for, wait_until, Condition, Error, Event, Future,
    FutureState, Runtime, RuntimeConfig, Task, TaskState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn block_on<T: Send + 'static>(root: Task<T>) -> pinc::Result<T> {
    Runtime::new(RuntimeConfig::default().with_pool_size(2)).block_on(root)
}

// ===== wait_until =====

#[test]
fn test_wait_until_times_out_and_cancels_inner() {
    let inner = sleep(Duration::from_secs(5));
    let inner_handle = inner.handle();
    let started = Instant::now();

    let err = block_on(wait_until(inner, Duration::from_millis(100))).unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "{}", err);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert!(inner_handle.is_cancelled());
    assert_eq!(inner_handle.state(), TaskState::Failed);
}

#[test]
fn test_wait_until_task_finishes_first() {
    let inner = Task::new(async {
        sleep(Duration::from_millis(10)).await?;
        Ok("done")
    });
    let value = block_on(wait_until(inner, Duration::from_secs(5))).unwrap();
    assert_eq!(value, "done");
}

#[test]
fn test_wait_until_propagates_inner_error() {
    let inner = Task::new(async { Err::<(), _>(Error::user("broken")) });
    let err = block_on(wait_until(inner, Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, Error::User(_)));
}

// ===== gather =====

#[test]
fn test_gather_first_failure_wins() {
    let finished = Arc::new(AtomicUsize::new(0));
    let slow_flag = finished.clone();
    let slow = Task::new(async move {
        sleep(Duration::from_millis(50)).await?;
        slow_flag.fetch_add(1, Ordering::SeqCst);
        Err::<u32, _>(Error::user("slow failure"))
    });
    let fast = Task::new(async {
        sleep(Duration::from_millis(5)).await?;
        Err::<u32, _>(Error::user("fast failure"))
    });
    let ok = Task::new(async { Ok(7u32) });

    let err = block_on(gather(vec![slow, fast, ok])).unwrap_err();
    assert_eq!(err.to_string(), Error::user("fast failure").to_string());
    // Siblings are not cancelled by the failure
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_gather_nested() {
    let root = Task::new(async {
        let inner = |base: u32| {
            gather((0..3u32).map(|i| Task::new(async move { Ok(base + i) })).collect())
        };
        let groups = gather(vec![inner(0), inner(10)]).await?;
        Ok(groups)
    });
    assert_eq!(block_on(root).unwrap(), vec![vec![0, 1, 2], vec![10, 11, 12]]);
}

// ===== wait_for =====

#[test]
fn test_wait_for_event() {
    let event = Event::new();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let gated = wait_for(
        Task::new(async move {
            flag.store(true, Ordering::SeqCst);
            Ok(42)
        }),
        &event,
    );

    let setter = {
        let event = event.clone();
        let ran = ran.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            assert!(!ran.load(Ordering::SeqCst));
            event.set();
        })
    };
    assert_eq!(block_on(gated).unwrap(), 42);
    setter.join().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_wait_for_condition() {
    let level = Arc::new(AtomicUsize::new(0));
    let observed = level.clone();
    let full = Condition::new(move || observed.load(Ordering::SeqCst) >= 2);

    let root = {
        let full = full.clone();
        let level = level.clone();
        Task::new(async move {
            let gated = wait_for(Task::new(async { Ok("released") }), &full);
            let filler = Task::new(async move {
                for _ in 0..2 {
                    sleep(Duration::from_millis(5)).await?;
                    level.fetch_add(1, Ordering::SeqCst);
                    full.notify();
                }
                Ok("filled")
            });
            gather(vec![gated, filler]).await
        })
    };
    assert_eq!(block_on(root).unwrap(), vec!["released", "filled"]);
    assert!(full.is_satisfied());
}

// ===== to_thread =====

#[test]
fn test_to_thread_eager_inside_runtime() {
    let root = Task::new(async {
        let task = to_thread(|| thread::current().name().map(str::to_string), false);
        // Already submitted, so it may have finished before the await
        let name = task.await?;
        Ok(name)
    });
    let name = block_on(root).unwrap().unwrap_or_default();
    assert!(name.contains("worker"), "{}", name);
}

#[test]
fn test_to_thread_lazy_runs_on_await() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let task = to_thread(move || counter.fetch_add(1, Ordering::SeqCst) + 1, true);
    assert_eq!(task.state(), TaskState::Created);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let handle = task.handle();
    assert_eq!(block_on(Task::new(async move { task.await })).unwrap(), 1);
    assert!(handle.is_done());
}

// ===== sync bridge =====

#[test]
fn test_sync_inside_runtime_task() {
    let root = Task::new(async {
        let local = sync(Task::new(async {
            sleep(Duration::from_millis(10)).await?;
            Ok(5)
        }))?;
        Ok(local * 2)
    });
    assert_eq!(block_on(root).unwrap(), 10);
}

#[test]
fn test_sync_then_resume_is_noop() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let task = Task::new(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let handle = task.handle();
    assert_eq!(handle.state(), TaskState::Created);
    sync(task).unwrap();
    assert_eq!(handle.state(), TaskState::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sync_finishes_hand_resumed_task() {
    let event = Event::new();
    let gate = event.clone();
    let task = Task::new(async move {
        gate.wait_for_set().await?;
        sleep(Duration::from_millis(5)).await?;
        Ok("after event")
    });
    assert_eq!(task.resume(), TaskState::Suspended);

    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        event.set();
    });
    let (tx, rx) = crossbeam::channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(sync(task));
    });
    let result = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("sync did not return");
    assert_eq!(result.unwrap(), "after event");
    setter.join().unwrap();
}

#[test]
fn test_join_on_hand_resumed_task_is_rejected() {
    let event = Event::new();
    let gate = event.clone();
    let task = Task::new(async move {
        gate.wait_for_set().await?;
        Ok(())
    });
    assert_eq!(task.resume(), TaskState::Suspended);
    assert!(matches!(task.join(), Err(Error::InvalidState(_))));
}

// ===== Future =====

#[test]
fn test_future_single_assignment() {
    let future = Future::new();
    future.set_value(1).unwrap();
    assert!(matches!(future.set_value(2), Err(Error::InvalidState(_))));
    assert!(matches!(
        future.set_exception(Error::Cancelled),
        Err(Error::InvalidState(_))
    ));
    assert_eq!(future.state(), FutureState::Resolved);
    assert_eq!(future.get_value().unwrap(), 1);
}

#[test]
fn test_future_wakes_blocked_thread() {
    let future = Arc::new(Future::<u8>::new());
    let setter = {
        let future = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            future.set_exception(Error::user("late failure")).unwrap();
        })
    };
    future.wait();
    assert_eq!(future.state(), FutureState::Failed);
    assert!(future.get_value().is_err());
    setter.join().unwrap();
}
