//! End-to-end tests through the tracker context: sampler → buffer → uplink → route

mod common;

use common::*;
use pawtrail_common::events::WalkEvent;
use pawtrail_common::{Actor, WalkState};
use pawtrail_tracker::remote::{RemoteError, RemoteWalk};
use pawtrail_tracker::sampler::{AppMode, ChannelProvider};
use pawtrail_tracker::session::history::SqliteHistoryArchive;
use pawtrail_tracker::watchdog::{StalenessWatchdog, LOCATION_LOST_REASON};
use pawtrail_tracker::{ErrorKind, WalkTracker};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct TrackerFixture {
    tracker: Arc<WalkTracker>,
    api: Arc<FakeWalkApi>,
    pool: sqlx::SqlitePool,
}

async fn tracker_fixture(extra_config: &str) -> TrackerFixture {
    let config = config_toml(extra_config);
    let pool = pawtrail_common::db::init_in_memory().await.unwrap();
    let api = FakeWalkApi::new();
    let archive = Arc::new(SqliteHistoryArchive::new(pool.clone()));
    let tracker = WalkTracker::with_parts(
        &config,
        pool.clone(),
        api.clone(),
        Arc::new(RecordingScheduler::default()),
        archive,
    );
    TrackerFixture {
        tracker: Arc::new(tracker),
        api,
        pool,
    }
}

async fn eventually<F, Fut>(what: &str, tracker: &Arc<WalkTracker>, check: F)
where
    F: Fn(Arc<WalkTracker>) -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check(tracker.clone()).await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn matched_walk(tracker: &WalkTracker) -> Uuid {
    let machine = tracker.machine();
    let id = machine.request_walk(Uuid::new_v4(), pets(1), PICKUP).await.unwrap().session_id;
    machine.assign_walker(id, Uuid::new_v4()).await.unwrap();
    id
}

#[tokio::test]
async fn test_tracked_walk_from_pickup_to_completion() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    assert!(tracker.is_tracking(id).await);

    assert!(handle.send_fix(north_of_pickup(15.0), 4.0, at_millis(1_000)).await);
    eventually("pickup sample on route", &tracker, |t| async move {
        !t.machine().session(id).await.unwrap().route.is_empty()
    })
    .await;

    tracker.machine().start_walk(id).await.unwrap();

    for i in 1..=3 {
        assert!(handle.send_fix(north_of_pickup(100.0 * i as f64), 4.0, at_millis(1_000 + i * 5_000)).await);
    }
    eventually("route complete", &tracker, |t| async move {
        t.machine().session(id).await.unwrap().route.len() == 4
    })
    .await;

    let completed = tracker.machine().end_walk(id).await.unwrap();
    assert_eq!(completed.state, WalkState::Completed);
    eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    assert!(tracker.buffer().is_empty(id).await.unwrap());

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_cancel_stops_sampler_mid_walk() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    handle.send_fix(PICKUP, 4.0, at_millis(1_000)).await;
    eventually("pickup sample on route", &tracker, |t| async move {
        !t.machine().session(id).await.unwrap().route.is_empty()
    })
    .await;
    tracker.machine().start_walk(id).await.unwrap();

    tracker.machine().cancel_walk(id, Actor::Client, "pet unwell").await.unwrap();

    eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    // The sampler dropped its provider; further fixes go nowhere
    tokio::time::timeout(Duration::from_secs(3), async {
        while !handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("provider closed");
    assert!(!handle.send_fix(north_of_pickup(30.0), 4.0, at_millis(9_000)).await);

    let start = tracker.machine().start_walk(id).await.unwrap_err();
    let end = tracker.machine().end_walk(id).await.unwrap_err();
    assert_eq!(start.kind(), ErrorKind::InvalidTransition);
    assert_eq!(end.kind(), ErrorKind::InvalidTransition);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_retain_policy_keeps_samples_for_later_flush() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;
    fx.api.fail_all_uploads(RemoteError::Network("offline".into()));

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    handle.send_fix(PICKUP, 4.0, at_millis(1_000)).await;
    handle.send_fix(PICKUP, 4.0, at_millis(2_000)).await;
    eventually("samples buffered", &tracker, |t| async move { t.buffer().len(id).await.unwrap() == 2 }).await;

    tracker.machine().cancel_walk(id, Actor::Walker, "emergency").await.unwrap();
    eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    assert_eq!(tracker.buffer().len(id).await.unwrap(), 2);

    fx.api.heal_uploads();
    assert_eq!(tracker.flush_retained(id).await.unwrap(), 2);
    assert!(tracker.buffer().is_empty(id).await.unwrap());

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_purge_policy_drops_samples_on_cancel() {
    let fx = tracker_fixture("[buffer]\ncancel_policy = \"purge\"\n").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;
    fx.api.fail_all_uploads(RemoteError::Network("offline".into()));

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    handle.send_fix(PICKUP, 4.0, at_millis(1_000)).await;
    eventually("sample buffered", &tracker, |t| async move { t.buffer().len(id).await.unwrap() == 1 }).await;

    tracker.machine().cancel_walk(id, Actor::Client, "rain").await.unwrap();
    assert!(tracker.buffer().is_empty(id).await.unwrap());

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_tracking_requires_matched_or_active_walk() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = tracker
        .machine()
        .request_walk(Uuid::new_v4(), pets(1), PICKUP)
        .await
        .unwrap()
        .session_id;

    let (_handle, provider) = ChannelProvider::new(1);
    let err = tracker.start_tracking(id, provider).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let (_handle, provider) = ChannelProvider::new(1);
    let err = tracker.start_tracking(Uuid::new_v4(), provider).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_provider_failure_marks_location_lost() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;

    let (handle, provider) = ChannelProvider::new(4);
    tracker.start_tracking(id, provider).await.unwrap();
    handle.fail("permission revoked").await;

    eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    let entry = tracker.machine().entry(id).await.unwrap();
    assert!(entry.tracking().await.location_lost);
    assert_eq!(tracker.machine().session(id).await.unwrap().state, WalkState::Matched);

    // A new provider restarts tracking
    let (_handle, provider) = ChannelProvider::new(4);
    tracker.start_tracking(id, provider).await.unwrap();
    assert!(tracker.is_tracking(id).await);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_watchdog_flags_once_and_cancels_lost_walks() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let machine = tracker.machine().clone();

    let quiet = matched_walk(&tracker).await;
    let lost = matched_walk(&tracker).await;
    for id in [quiet, lost] {
        machine
            .record_acknowledged(id, vec![pawtrail_common::LocationSample::new(id, PICKUP, 3.0, at_millis(1_000))])
            .await
            .unwrap();
        machine.start_walk(id).await.unwrap();
    }
    machine.report_location_unavailable(lost, "gps off").await.unwrap();

    let watchdog = StalenessWatchdog::new(machine.clone(), Duration::from_secs(60));
    let now = chrono::Utc::now();

    let fresh = watchdog.scan(now).await.unwrap();
    assert!(fresh.flagged.is_empty());

    let later = now + chrono::Duration::seconds(120);
    let report = watchdog.scan(later).await.unwrap();
    let mut flagged = report.flagged.clone();
    flagged.sort();
    let mut expected = vec![quiet, lost];
    expected.sort();
    assert_eq!(flagged, expected);
    assert_eq!(report.cancelled, vec![lost]);

    let again = watchdog.scan(later + chrono::Duration::seconds(5)).await.unwrap();
    assert!(again.flagged.is_empty());
    assert!(again.cancelled.is_empty());

    assert_eq!(machine.session(quiet).await.unwrap().state, WalkState::Active);
    assert_eq!(machine.session(lost).await.unwrap().state, WalkState::Cancelled);

    let api = fx.api.clone();
    eventually("cancel notified", &tracker, move |_| {
        let api = api.clone();
        async move {
            api.calls()
                .contains(&format!("cancel:{}:system:{}", lost, LOCATION_LOST_REASON))
        }
    })
    .await;

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_recover_restores_walks_and_resumes_uploads() {
    let account = Uuid::new_v4();
    let fx = tracker_fixture(&format!("account_id = \"{}\"", account)).await;
    let tracker = fx.tracker.clone();

    let active = Uuid::new_v4();
    let gone = Uuid::new_v4();
    fx.api.set_in_flight(vec![RemoteWalk {
        session_id: active,
        client_id: Uuid::new_v4(),
        walker_id: Some(Uuid::new_v4()),
        pet_ids: vec![Uuid::new_v4()],
        pickup: PICKUP,
        state: WalkState::Active,
        requested_at: at_millis(1_000),
        started_at: Some(at_millis(2_000)),
        ended_at: None,
    }]);

    for (id, ms) in [(active, 3_000), (active, 4_000), (gone, 3_000)] {
        let sample = pawtrail_common::LocationSample::new(id, PICKUP, 5.0, at_millis(ms));
        tracker.buffer().enqueue(&sample).await.unwrap();
    }

    let report = tracker.recover().await.unwrap();
    assert_eq!(report.restored, vec![active]);
    assert_eq!(report.resumed, vec![active]);
    assert_eq!(report.orphaned, vec![gone]);

    eventually("restored walk uploaded", &tracker, |t| async move {
        t.buffer().is_empty(active).await.unwrap()
    })
    .await;
    assert_eq!(tracker.machine().session(active).await.unwrap().route.len(), 2);
    assert_eq!(tracker.buffer().len(gone).await.unwrap(), 1);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_app_mode_switch() {
    let fx = tracker_fixture("").await;
    assert_eq!(fx.tracker.app_mode(), AppMode::Foreground);
    fx.tracker.set_app_mode(AppMode::Background);
    assert_eq!(fx.tracker.app_mode(), AppMode::Background);
}

#[tokio::test]
async fn test_shutdown_clears_registry() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;
    let token = tracker.machine().entry(id).await.unwrap().cancellation();

    tracker.start_background().await;
    tracker.shutdown().await;

    assert!(token.is_cancelled());
    assert!(tracker.registry().is_empty().await);
}

async fn next_degraded(rx: &mut tokio::sync::broadcast::Receiver<WalkEvent>, id: Uuid) -> String {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(WalkEvent::TrackingDegraded { session_id, message, .. }) if session_id == id => return message,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("TrackingDegraded event")
}

#[tokio::test]
async fn test_storage_error_drops_sample_but_keeps_sampling() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;
    let mut rx = tracker.machine().events().subscribe();

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    fx.pool.close().await;

    assert!(handle.send_fix(north_of_pickup(10.0), 4.0, at_millis(1_000)).await);
    next_degraded(&mut rx, id).await;
    assert!(tracker.is_tracking(id).await);

    // The next fix is still consumed and attempted
    assert!(handle.send_fix(north_of_pickup(20.0), 4.0, at_millis(2_000)).await);
    next_degraded(&mut rx, id).await;
    assert!(tracker.is_tracking(id).await);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_full_buffer_stops_sampler() {
    let fx = tracker_fixture("[buffer]\nmax_samples = 1\n").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;
    fx.api.fail_all_uploads(RemoteError::Rejected(400, "bad batch".into()));
    let mut rx = tracker.machine().events().subscribe();

    let (handle, provider) = ChannelProvider::new(16);
    tracker.start_tracking(id, provider).await.unwrap();
    assert!(handle.send_fix(north_of_pickup(10.0), 4.0, at_millis(1_000)).await);
    assert!(handle.send_fix(north_of_pickup(20.0), 4.0, at_millis(2_000)).await);

    let message = next_degraded(&mut rx, id).await;
    assert!(message.contains("buffer full"), "unexpected message: {}", message);
    eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    assert_eq!(tracker.buffer().len(id).await.unwrap(), 1);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_finished_tasks_are_not_kept() {
    let fx = tracker_fixture("").await;
    let tracker = fx.tracker.clone();
    let id = matched_walk(&tracker).await;

    for _ in 0..10 {
        let (handle, provider) = ChannelProvider::new(4);
        tracker.start_tracking(id, provider).await.unwrap();
        handle.fail("gps off").await;
        eventually("sampler stopped", &tracker, |t| async move { !t.is_tracking(id).await }).await;
    }

    // Only the walk's uplink loop is left running
    eventually("finished samplers pruned", &tracker, |t| async move { t.running_tasks().await == 1 }).await;

    tracker.shutdown().await;
    assert_eq!(tracker.running_tasks().await, 0);
}
