use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use muxkv_client::{CancellationToken, ExclusiveMutex, LockCanceled};

fn compete_blocking(mutex: &ExclusiveMutex, workers: usize, hold: Duration) -> (usize, usize) {
    let successes = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let mutex = mutex.clone();
            let successes = Arc::clone(&successes);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let token = mutex.try_acquire_sync(None);
                if token.success() {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(hold);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }
    (successes.load(Ordering::SeqCst), peak.load(Ordering::SeqCst))
}

#[test]
fn short_holds_let_every_competitor_in() {
    let mutex = ExclusiveMutex::new(Duration::from_millis(1_000));
    let (successes, peak) = compete_blocking(&mutex, 5, Duration::from_millis(10));
    assert_eq!(successes, 5);
    assert_eq!(peak, 1);
    assert!(!mutex.is_held());
    assert!(!mutex.has_waiters());
}

#[test]
fn long_holder_starves_every_competitor() {
    let mutex = ExclusiveMutex::new(Duration::from_millis(50));
    let holder = mutex.try_acquire_sync(None);
    assert!(holder.success());

    let started = Instant::now();
    let (successes, _) = compete_blocking(&mutex, 5, Duration::ZERO);
    assert_eq!(successes, 0);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!mutex.has_waiters());

    drop(holder);
    assert!(mutex.try_acquire_sync(None).success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_competitors_take_turns() {
    let mutex = ExclusiveMutex::new(Duration::from_millis(1_000));
    let inside = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let mutex = mutex.clone();
            let inside = Arc::clone(&inside);
            tokio::spawn(async move {
                let token = mutex.try_acquire_async(None).await.expect("not canceled");
                assert!(token.success());
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task");
    }
    assert!(!mutex.is_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_holder_hands_off_to_async_waiter() {
    let mutex = ExclusiveMutex::new(Duration::from_millis(1_000));
    let holder = {
        let mutex = mutex.clone();
        thread::spawn(move || {
            let mut token = mutex.try_acquire_sync(None);
            thread::sleep(Duration::from_millis(50));
            token.release();
        })
    };
    // Make sure the thread wins the race for the lock first.
    while !mutex.is_held() {
        tokio::task::yield_now().await;
    }

    let awaitable = mutex.try_acquire_async(None);
    assert!(!awaitable.is_completed_synchronously());
    let token = awaitable.await.expect("not canceled");
    assert!(token.success());
    holder.join().expect("holder");
}

#[tokio::test]
async fn canceled_waiter_never_receives_the_lock() {
    let mutex = ExclusiveMutex::new(Duration::from_secs(5));
    let holder = mutex.try_acquire_sync(None);
    let signal = CancellationToken::new();

    let first = mutex.try_acquire_async(Some(&signal));
    let second = mutex.try_acquire_async(None);
    signal.cancel();
    assert_eq!(first.await.unwrap_err(), LockCanceled);

    drop(holder);
    let token = second.await.expect("not canceled");
    assert!(token.success());
}
