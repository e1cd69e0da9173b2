//! FIFO admission ordering and queue-depth reporting, exercised through the
//! public coordinator rather than the private `NextQueue` it wraps.

use std::sync::Arc;
use std::time::Duration;

use spark_quota::{JobFailure, JobReturn, MultiRateLimit, RateLimit, TicketOutcome};

type Fut = futures::future::BoxFuture<'static, Result<JobReturn<u32>, JobFailure<String>>>;

fn recording_job(order: Arc<std::sync::Mutex<Vec<u32>>>, id: u32, delay: Duration) -> Fut {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        order.lock().unwrap().push(id);
        Ok(JobReturn { value: id, adjustment: None })
    })
}

#[tokio::test(start_paused = true)]
async fn queued_jobs_dispatch_in_strict_fifo_order() {
    let limits = vec![vec![RateLimit::per_second(100).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 1).unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    // The first job holds the single slot for a while so the next two queue up.
    let first = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 1, Duration::from_millis(30)))
        .unwrap();
    let second = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 2, Duration::ZERO))
        .unwrap();
    let third = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 3, Duration::ZERO))
        .unwrap();

    assert!(matches!(first.wait().await, TicketOutcome::Completed(1)));
    assert!(matches!(second.wait().await, TicketOutcome::Completed(2)));
    assert!(matches!(third.wait().await, TicketOutcome::Completed(3)));

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_non_head_entry_does_not_disturb_the_remaining_order() {
    let limits = vec![vec![RateLimit::per_second(100).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 1).unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let first = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 1, Duration::from_millis(30)))
        .unwrap();
    let mut second = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 2, Duration::ZERO))
        .unwrap();
    let third = limiter
        .reserve(vec![1], recording_job(Arc::clone(&order), 3, Duration::ZERO))
        .unwrap();

    assert!(second.cancel().unwrap());

    assert!(matches!(first.wait().await, TicketOutcome::Completed(1)));
    assert!(matches!(second.wait().await, TicketOutcome::Cancelled));
    assert!(matches!(third.wait().await, TicketOutcome::Completed(3)));

    assert_eq!(*order.lock().unwrap(), vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn stats_reports_the_depth_of_the_queue() {
    let limits = vec![vec![RateLimit::per_second(100).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 1).unwrap();

    let held: Fut = Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(JobReturn { value: 0u32, adjustment: None })
    });
    let second_job: Fut = Box::pin(async { Ok(JobReturn { value: 0, adjustment: None }) });
    let third_job: Fut = Box::pin(async { Ok(JobReturn { value: 0, adjustment: None }) });

    let _first = limiter.reserve(vec![1], held).unwrap();
    let _second = limiter.reserve(vec![2], second_job).unwrap();
    let _third = limiter.reserve(vec![3], third_job).unwrap();

    // Give the coordinator a chance to observe the buffer is full and queue
    // the other two before we inspect stats.
    tokio::task::yield_now().await;
    let snapshot = limiter.stats().await.unwrap();
    assert_eq!(snapshot.next_uses[0], 5);
    // past=0, current=1 (the held job still in flight), next=5, limit=100.
    assert_eq!(snapshot.next_use_percents(), vec![vec![6.0]]);
}
