use std::{collections::HashMap, sync::Arc, time::Duration};
use taghist_core::{
    AddressCache, DeliverFn, PollScheduler, SessionRegistry, SimDevice, SourceRegistry,
};
use taghist_error::THError;
use taghist_models::{settings::PollerConfig, SourceSpec, TagSample, THValue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn sources_with_a01(sim: &SimDevice) -> Arc<SourceRegistry> {
    let mut sources = HashMap::new();
    sources.insert(
        "A01".to_string(),
        SourceSpec::new("A01", "192.168.0.10", 0, 2),
    );
    Arc::new(SourceRegistry::new(sources, sim.factory()))
}

fn channel_deliver() -> (DeliverFn, mpsc::UnboundedReceiver<Vec<TagSample>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let deliver: DeliverFn = Arc::new(move |samples| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(samples)
                .map_err(|_| THError::DeliveryError("receiver closed".into()))
        })
    });
    (deliver, rx)
}

fn scheduler(
    registry: &Arc<SessionRegistry>,
    sources: &Arc<SourceRegistry>,
) -> PollScheduler {
    PollScheduler::new(
        PollerConfig::default(),
        Arc::clone(registry),
        Arc::new(AddressCache::new()),
        Arc::clone(sources),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn change_is_delivered_once_and_only_on_change() {
    let sim = SimDevice::new();
    // Device block 10 holds bytes [0x00, 0x0A] at offset 2.
    sim.set_bytes(10, 2, &[0x00, 0x0A]);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert("S", vec!["A01_DB10.DBW2".to_string()], deliver);

    let scheduler = scheduler(&registry, &sources);

    // First cycle: null -> 10 is a change.
    scheduler.run_cycle().await;
    let batch = rx.try_recv().expect("first cycle should deliver");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name, "A01_DB10.DBW2");
    assert_eq!(batch[0].value, THValue::Int16(10));

    // Second cycle returns the same bytes: no delivery.
    scheduler.run_cycle().await;
    assert!(rx.try_recv().is_err());

    // Value changes on the device: exactly one more delivery.
    sim.set_int16(10, 2, 11);
    scheduler.run_cycle().await;
    let batch = rx.try_recv().expect("changed value should deliver");
    assert_eq!(batch[0].value, THValue::Int16(11));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn adjacent_tags_are_read_in_one_window() {
    let sim = SimDevice::new();
    sim.set_int16(10, 0, 1);
    sim.set_int16(10, 2, 2);
    sim.set_int32(10, 4, 3);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert(
        "S",
        vec![
            "A01_DB10.DBW0".to_string(),
            "A01_DB10.DBW2".to_string(),
            "A01_DB10.DBD4".to_string(),
        ],
        deliver,
    );

    scheduler(&registry, &sources).run_cycle().await;

    // One merged window means exactly one device read.
    assert_eq!(sim.read_count(), 1);
    let batch = rx.try_recv().unwrap();
    assert_eq!(batch.len(), 3);
}

#[tokio::test]
async fn bit_tags_decode_msb_first() {
    let sim = SimDevice::new();
    sim.set_bit(10, 0, 3, true);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert(
        "S",
        vec!["A01_DB10.DBX0.3".to_string(), "A01_DB10.DBX0.4".to_string()],
        deliver,
    );

    scheduler(&registry, &sources).run_cycle().await;

    let batch = rx.try_recv().unwrap();
    let by_name: HashMap<_, _> = batch
        .into_iter()
        .map(|s| (s.name.clone(), s.value))
        .collect();
    // Both tags transition away from null, so both deliver once.
    assert_eq!(by_name["A01_DB10.DBX0.3"], THValue::Bool(true));
    assert_eq!(by_name["A01_DB10.DBX0.4"], THValue::Bool(false));
}

#[tokio::test]
async fn unparseable_and_unknown_tags_are_excluded() {
    let sim = SimDevice::new();
    sim.set_int16(10, 2, 5);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert(
        "S",
        vec![
            "not an address".to_string(),
            "B99_DB1.DBW0".to_string(), // unknown source key
            "A01_DB10.DBW2".to_string(),
        ],
        deliver,
    );

    scheduler(&registry, &sources).run_cycle().await;

    let batch = rx.try_recv().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name, "A01_DB10.DBW2");
}

#[tokio::test]
async fn delivery_failure_removes_session() {
    let sim = SimDevice::new();
    sim.set_int16(10, 2, 5);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let failing: DeliverFn = Arc::new(|_| {
        Box::pin(async { Err(THError::DeliveryError("socket gone".into())) })
    });
    registry.upsert("S", vec!["A01_DB10.DBW2".to_string()], failing);
    assert_eq!(registry.session_count(), 1);

    let scheduler = scheduler(&registry, &sources);
    scheduler.run_cycle().await;

    assert_eq!(registry.session_count(), 0);
    assert_eq!(scheduler.metrics().await.sessions_dropped, 1);
}

#[tokio::test]
async fn unreachable_source_is_isolated_and_recovers() {
    let sim = SimDevice::new();
    sim.set_int16(10, 2, 7);
    sim.set_fail_connect(true);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert("S", vec!["A01_DB10.DBW2".to_string()], deliver);

    let scheduler = scheduler(&registry, &sources);

    // Connect fails: the cycle completes, nothing is delivered, the
    // session survives.
    scheduler.run_cycle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(registry.session_count(), 1);
    assert_eq!(scheduler.metrics().await.sources_skipped, 1);

    // Next cycle is the retry.
    sim.set_fail_connect(false);
    scheduler.run_cycle().await;
    let batch = rx.try_recv().expect("recovered source should deliver");
    assert_eq!(batch[0].value, THValue::Int16(7));
}

#[tokio::test]
async fn window_read_failure_skips_members_for_one_cycle() {
    let sim = SimDevice::new();
    sim.set_int16(10, 2, 9);

    let sources = sources_with_a01(&sim);
    let registry = Arc::new(SessionRegistry::new());
    let (deliver, mut rx) = channel_deliver();
    registry.upsert("S", vec!["A01_DB10.DBW2".to_string()], deliver);

    let scheduler = scheduler(&registry, &sources);

    // Connection opens fine but the read itself fails.
    sim.set_fail_reads(true);
    scheduler.run_cycle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(scheduler.metrics().await.window_failures, 1);

    sim.set_fail_reads(false);
    scheduler.run_cycle().await;
    assert_eq!(rx.try_recv().unwrap()[0].value, THValue::Int16(9));
}

mod historian_stack {
    use super::*;
    use chrono::{Duration as ChronoDuration, Local};
    use taghist_core::Historian;
    use taghist_models::settings::{
        General, HistoryConfig, Inner, LogConfig, PollerConfig, SourceEntry,
    };
    use taghist_models::Settings;
    use tempfile::TempDir;

    fn test_settings(data_dir: &std::path::Path) -> Settings {
        let mut sources = HashMap::new();
        sources.insert(
            "A01".to_string(),
            SourceEntry {
                address: "192.168.0.10".to_string(),
                rack: 0,
                slot: 2,
            },
        );
        Settings::with_inner(Inner {
            general: General {
                data_dir: data_dir.display().to_string(),
            },
            poller: PollerConfig {
                interval_ms: 20,
                max_window_bytes: 2000,
            },
            history: HistoryConfig {
                // Flush immediately so the test can observe rows without
                // waiting for 50 changes.
                flush_threshold: 1,
                queue_capacity: 16,
                tag_seed_lookback_days: 3,
            },
            log: LogConfig::default(),
            sources,
        })
    }

    #[tokio::test]
    async fn subscribed_changes_reach_client_and_history_store() {
        let dir = TempDir::new().unwrap();
        let sim = SimDevice::new();
        sim.set_int16(10, 2, 10);

        let historian = Historian::new(test_settings(dir.path()), sim.factory())
            .await
            .unwrap();
        historian.start().await.unwrap();

        let (deliver, mut rx) = channel_deliver();
        historian
            .subscribe("client-1", vec!["A01_DB10.DBW2".to_string()], deliver)
            .unwrap();

        // Let a few cycles run.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batch = rx.recv().await.expect("client should see the first value");
        assert_eq!(batch[0].value, THValue::Int16(10));

        // The historization session saw the same change and the writer
        // persisted it.
        let now = Local::now();
        let rows = historian
            .query(
                &["A01_DB10.DBW2".to_string()],
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert!(!rows.is_empty(), "history store should hold the sample");
        assert_eq!(rows[0].value, THValue::Float64(10.0));

        assert!(historian.metrics().await.cycles > 0);
        historian.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reserved_session_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sim = SimDevice::new();
        let historian = Historian::new(test_settings(dir.path()), sim.factory())
            .await
            .unwrap();
        let (deliver, _rx) = channel_deliver();
        assert!(historian
            .subscribe("__history__", vec![], deliver)
            .is_err());
        historian.shutdown().await.unwrap();
    }
}
