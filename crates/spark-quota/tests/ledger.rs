//! Sliding-window eviction and retroactive usage adjustment, exercised
//! through `stats()` and `JobReturn`/`JobFailure::Overwrite` rather than the
//! private `PastLedger` directly.

use std::time::Duration;

use spark_quota::{JobFailure, JobReturn, MultiRateLimit, RateLimit};

type Fut = futures::future::BoxFuture<'static, Result<JobReturn<u32>, JobFailure<String>>>;

#[tokio::test(start_paused = true)]
async fn past_usage_drops_out_of_stats_once_the_window_elapses() {
    let limits = vec![vec![RateLimit::per_second(10).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 4).unwrap();

    let job: Fut = Box::pin(async { Ok(JobReturn { value: 0, adjustment: None }) });
    let ticket = limiter.reserve(vec![4], job).unwrap();
    ticket.wait().await;

    let right_after = limiter.stats().await.unwrap();
    assert_eq!(right_after.past_uses[0][0], 4);

    tokio::time::advance(Duration::from_millis(1_100)).await;

    let after_window = limiter.stats().await.unwrap();
    assert_eq!(after_window.past_uses[0][0], 0, "usage older than the 1s window should no longer count");
}

#[tokio::test(start_paused = true)]
async fn a_successful_jobs_adjustment_charges_the_ledger_a_different_amount() {
    let limits = vec![vec![RateLimit::per_second(10).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 4).unwrap();

    // Reserve 8, but the job discovers it only actually needed 1.
    let job: Fut = Box::pin(async {
        Ok(JobReturn {
            value: 0,
            adjustment: Some((0.0, vec![1])),
        })
    });
    let ticket = limiter.reserve(vec![8], job).unwrap();
    ticket.wait().await;

    let snapshot = limiter.stats().await.unwrap();
    assert_eq!(snapshot.past_uses[0][0], 1, "the ledger should reflect the adjusted usage, not the reservation");
}

#[tokio::test(start_paused = true)]
async fn a_failed_jobs_overwrite_charges_the_ledger_at_a_different_time() {
    let limits = vec![vec![RateLimit::per_second(10).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 4).unwrap();

    let job: Fut = Box::pin(async {
        Err(JobFailure::Overwrite {
            at: -10.0,
            usage: vec![3],
            cause: "partial failure, already spent some of the budget earlier".to_string(),
        })
    });
    let ticket = limiter.reserve(vec![8], job).unwrap();
    let outcome = ticket.wait().await;
    assert!(matches!(outcome, spark_quota::TicketOutcome::Failed(_)));

    // The overwrite backdates the charge outside the 1s window, so it
    // should no longer count toward `past`.
    let snapshot = limiter.stats().await.unwrap();
    assert_eq!(snapshot.past_uses[0][0], 0);
}

#[tokio::test(start_paused = true)]
async fn an_invalid_adjustment_falls_back_to_the_original_reserved_usage() {
    let limits = vec![vec![RateLimit::per_second(10).unwrap()]];
    let limiter: MultiRateLimit<u32, String> = MultiRateLimit::new(limits, 4).unwrap();

    // Only one dimension is configured, but the adjustment claims two.
    let job: Fut = Box::pin(async {
        Ok(JobReturn {
            value: 0,
            adjustment: Some((0.0, vec![1, 2])),
        })
    });
    let ticket = limiter.reserve(vec![5], job).unwrap();
    let outcome = ticket.wait().await;
    assert!(matches!(outcome, spark_quota::TicketOutcome::InvalidAdjustment(_)));

    let snapshot = limiter.stats().await.unwrap();
    assert_eq!(snapshot.past_uses[0][0], 5, "an invalid adjustment must charge the originally reserved usage");
}
