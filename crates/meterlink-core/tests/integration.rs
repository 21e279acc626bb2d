//! End-to-end synchronization against simulated meters.
//!
//! Every test wires the real tracker, session manager, assembler and
//! synchronizer to a [`MockNetwork`] and runs on a paused tokio clock, so
//! timeouts elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use meterlink_core::mock::{MemoryPersistence, MockNetwork, StaticMetadata, interval_metadata};
use meterlink_core::{
    BlockAssembler, CycleOutcome, DeviceLocks, ExchangeTimings, FixedClock, PersistencePort,
    ProfileRegistry, ProfileSynchronizer, SessionConfig, SessionManager, SyncConfig, SyncMetrics,
    SyncPorts,
};
use meterlink_types::{CapturePeriod, ObisCode, ProfileCursor, ProfileId, Value, obis};
use proptest::prelude::*;
use time::OffsetDateTime;
use time::macros::datetime;

struct Rig {
    network: Arc<MockNetwork>,
    store: Arc<MemoryPersistence>,
    metrics: Arc<SyncMetrics>,
    clock: Arc<FixedClock>,
    sync: Arc<ProfileSynchronizer>,
}

fn rig(now: OffsetDateTime, batch_size: u32) -> Rig {
    let network = MockNetwork::new();
    let sessions = Arc::new(SessionManager::new(
        network.tracker(),
        network.clone(),
        SessionConfig {
            timings: ExchangeTimings::new(Duration::from_secs(5), Duration::from_secs(5)),
            ..Default::default()
        },
    ));
    let metadata = StaticMetadata::new()
        .with_profile("load_profile_1", interval_metadata(obis::LOAD_PROFILE_1))
        .with_profile("daily_billing", interval_metadata(obis::DAILY_BILLING_PROFILE))
        .with_profile("monthly_billing", interval_metadata(obis::MONTHLY_BILLING_PROFILE));
    let store = Arc::new(MemoryPersistence::new());
    let metrics = SyncMetrics::shared();
    let clock = Arc::new(FixedClock::new(now));
    let sync = Arc::new(ProfileSynchronizer::new(
        Arc::new(BlockAssembler::new(sessions)),
        SyncPorts {
            metadata: Arc::new(metadata),
            persistence: store.clone(),
            metrics: metrics.clone(),
            locks: Arc::new(DeviceLocks::new()),
            clock: clock.clone(),
        },
        Arc::new(ProfileRegistry::default()),
        SyncConfig {
            batch_size,
            ..Default::default()
        },
    ));
    Rig {
        network,
        store,
        metrics,
        clock,
        sync,
    }
}

fn profile(id: &str) -> ProfileId {
    ProfileId::from(id)
}

async fn cursor_of(rig: &Rig, device: &str, id: &str) -> Option<OffsetDateTime> {
    rig.store
        .load_cursor(device, &profile(id))
        .await
        .unwrap()
        .map(|c| c.last_timestamp)
}

fn push_calendar_rows(rig: &Rig, device: &str, profile: ObisCode, stamps: &[OffsetDateTime]) {
    let meter = rig.network.add_meter(device);
    // A period of 0 marks one calendar unit.
    meter.add_profile(profile, 0);
    for (i, t) in stamps.iter().enumerate() {
        meter.push_row(
            profile,
            *t,
            vec![Value::Unsigned(500 * i as u64), Value::Unsigned(i as u64)],
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_cycle_seeds_and_catches_up() {
    let rig = rig(datetime!(2024-01-01 06:00 UTC), 8);
    let meter = rig.network.add_meter("MTR-1");
    meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 24, 900);
    meter.set_rows_per_block(5);

    let report = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;

    assert_eq!(report.outcome, CycleOutcome::CaughtUp);
    assert_eq!(report.cursor_before, Some(datetime!(2024-01-01 00:00 UTC)));
    assert_eq!(report.inserted, 24);
    assert_eq!(
        cursor_of(&rig, "MTR-1", "load_profile_1").await,
        Some(datetime!(2024-01-01 06:00 UTC))
    );
    assert_eq!(meter.associations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resync_of_same_window_inserts_nothing() {
    let rig = rig(datetime!(2024-01-01 02:00 UTC), 4);
    let meter = rig.network.add_meter("MTR-1");
    meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 8, 900);

    let first = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;
    assert_eq!(first.inserted, 8);

    rig.sync.forget_cursor("MTR-1", &profile("load_profile_1"));
    rig.store.set_cursor(ProfileCursor {
        device_id: "MTR-1".to_string(),
        profile_id: profile("load_profile_1"),
        last_timestamp: datetime!(2024-01-01 00:00 UTC),
        capture_period: CapturePeriod::Seconds(900),
    });
    let second = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;

    assert_eq!(second.rows_read, 8);
    assert_eq!(second.inserted, 0);
    assert_eq!(rig.store.rows("MTR-1", &profile("load_profile_1")).len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_new_records_are_picked_up_by_later_cycles() {
    let rig = rig(datetime!(2024-01-01 01:00 UTC), 4);
    let meter = rig.network.add_meter("MTR-1");
    meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 4, 900);

    rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;
    assert_eq!(
        cursor_of(&rig, "MTR-1", "load_profile_1").await,
        Some(datetime!(2024-01-01 01:00 UTC))
    );

    for i in 0..4u64 {
        meter.push_row(
            obis::LOAD_PROFILE_1,
            datetime!(2024-01-01 01:00 UTC) + Duration::from_secs(900 * i),
            vec![Value::Unsigned(20_000 + i), Value::Unsigned(0)],
        );
    }
    rig.clock.advance(Duration::from_secs(3600));
    let report = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;

    assert_eq!(report.inserted, 4);
    assert_eq!(rig.store.rows("MTR-1", &profile("load_profile_1")).len(), 8);
    assert_eq!(
        cursor_of(&rig, "MTR-1", "load_profile_1").await,
        Some(datetime!(2024-01-01 02:00 UTC))
    );
}

#[tokio::test(start_paused = true)]
async fn test_broken_cycle_retries_same_window_next_time() {
    let rig = rig(datetime!(2024-01-01 01:00 UTC), 4);
    let meter = rig.network.add_meter("MTR-1");
    meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 4, 900);
    rig.store.set_cursor(ProfileCursor {
        device_id: "MTR-1".to_string(),
        profile_id: profile("load_profile_1"),
        last_timestamp: datetime!(2024-01-01 00:00 UTC),
        capture_period: CapturePeriod::Seconds(900),
    });

    meter.set_online(false);
    let broken = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;
    assert_eq!(broken.outcome, CycleOutcome::Broke);
    assert_eq!(
        cursor_of(&rig, "MTR-1", "load_profile_1").await,
        Some(datetime!(2024-01-01 00:00 UTC))
    );

    meter.set_online(true);
    meter.set_silent_block(1);
    let broken = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;
    assert_eq!(broken.outcome, CycleOutcome::Broke);
    assert_eq!(
        rig.metrics
            .failure_count("MTR-1", &profile("load_profile_1"), "recovery_failed"),
        2
    );

    meter.set_silent_block(0);
    let healed = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;
    assert_eq!(healed.outcome, CycleOutcome::CaughtUp);
    assert_eq!(healed.cursor_before, Some(datetime!(2024-01-01 00:00 UTC)));
    assert_eq!(healed.inserted, 4);
}

#[tokio::test(start_paused = true)]
async fn test_daily_profile_reads_one_day_per_window() {
    let rig = rig(datetime!(2024-01-05 12:00 UTC), 96);
    let days: Vec<OffsetDateTime> = (0..5)
        .map(|d| datetime!(2024-01-01 00:00 UTC) + time::Duration::days(d))
        .collect();
    push_calendar_rows(&rig, "MTR-1", obis::DAILY_BILLING_PROFILE, &days);

    let report = rig.sync.run("MTR-1", &profile("daily_billing"), None).await;

    assert_eq!(report.outcome, CycleOutcome::CaughtUp);
    assert_eq!(report.inserted, 5);
    let meter = rig.network.meter("MTR-1").unwrap();
    assert_eq!(
        meter.range_reads()[0],
        (datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC))
    );
    let cursor = rig
        .store
        .load_cursor("MTR-1", &profile("daily_billing"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cursor.capture_period, CapturePeriod::Daily);
    assert_eq!(cursor.last_timestamp, datetime!(2024-01-06 00:00 UTC));
}

#[tokio::test(start_paused = true)]
async fn test_monthly_profile_rereads_boundary_record() {
    let rig = rig(datetime!(2024-04-15 00:00 UTC), 96);
    push_calendar_rows(
        &rig,
        "MTR-1",
        obis::MONTHLY_BILLING_PROFILE,
        &[
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-02-01 00:00 UTC),
            datetime!(2024-03-01 00:00 UTC),
            datetime!(2024-04-01 00:00 UTC),
        ],
    );

    let report = rig.sync.run("MTR-1", &profile("monthly_billing"), None).await;

    assert_eq!(report.outcome, CycleOutcome::CaughtUp);
    assert_eq!(report.inserted, 4);
    // Windows share their boundary records: 2 + 2 + 2 + 1 rows.
    assert_eq!(report.rows_read, 7);
    assert_eq!(report.windows, 4);
    assert_eq!(
        cursor_of(&rig, "MTR-1", "monthly_billing").await,
        Some(datetime!(2024-05-01 00:00 UTC))
    );
}

#[tokio::test(start_paused = true)]
async fn test_devices_and_profiles_run_concurrently() {
    let rig = rig(datetime!(2024-01-01 02:00 UTC), 4);
    for device in ["MTR-1", "MTR-2", "MTR-3"] {
        let meter = rig.network.add_meter(device);
        meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 8, 900);
        meter.set_rows_per_block(3);
        meter.set_reply_delay(Duration::from_millis(200));
    }
    push_calendar_rows(
        &rig,
        "MTR-1",
        obis::DAILY_BILLING_PROFILE,
        &[datetime!(2024-01-01 00:00 UTC)],
    );

    let mut tasks = Vec::new();
    for (device, id) in [
        ("MTR-1", "load_profile_1"),
        ("MTR-1", "daily_billing"),
        ("MTR-2", "load_profile_1"),
        ("MTR-3", "load_profile_1"),
    ] {
        let sync = Arc::clone(&rig.sync);
        tasks.push(tokio::spawn(async move {
            sync.run(device, &ProfileId::from(id), None).await
        }));
    }
    for task in tasks {
        let report = task.await.unwrap();
        assert!(report.is_success(), "{:?}", report);
    }

    for device in ["MTR-1", "MTR-2", "MTR-3"] {
        assert_eq!(rig.store.rows(device, &profile("load_profile_1")).len(), 8);
    }
    assert_eq!(rig.store.rows("MTR-1", &profile("daily_billing")).len(), 1);
    assert_eq!(rig.network.meter("MTR-1").unwrap().associations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_meter_replies_are_salvaged_in_late_window() {
    let rig = rig(datetime!(2024-01-01 01:00 UTC), 4);
    let meter = rig.network.add_meter("MTR-1");
    meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 4, 900);
    // Past the 5 s nominal wait, inside the 5 s late-listen window.
    meter.set_reply_delay(Duration::from_secs(7));

    let report = rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;

    assert_eq!(report.outcome, CycleOutcome::CaughtUp);
    assert_eq!(report.inserted, 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever fails along the way, the stored cursor never moves back.
    #[test]
    fn prop_cursor_never_decreases(
        steps in prop::collection::vec((0u32..4, 1u64..5, 0usize..4), 1..6)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let start = datetime!(2024-01-01 00:00 UTC);
            let rig = rig(start + Duration::from_secs(3600), 4);
            let meter = rig.network.add_meter("MTR-1");
            meter.fill_interval_profile(obis::LOAD_PROFILE_1, start, 48, 900);

            let mut last: Option<OffsetDateTime> = None;
            for (silent, hours, per_block) in steps {
                meter.set_silent_block(silent);
                meter.set_rows_per_block(per_block);
                rig.sync.run("MTR-1", &profile("load_profile_1"), None).await;

                let cursor = cursor_of(&rig, "MTR-1", "load_profile_1").await;
                if let (Some(before), Some(after)) = (last, cursor) {
                    prop_assert!(after >= before, "cursor moved back: {} -> {}", before, after);
                }
                last = cursor.or(last);
                rig.clock.advance(Duration::from_secs(3600 * hours));
            }
            Ok(())
        })?;
    }
}
