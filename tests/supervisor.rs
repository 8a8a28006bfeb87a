mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{direct_message, eventually, group_text_frame, temp_store, FakeConnector, FakeRadio, RecordingSink};
use meshgate::errors::GatewayError;
use meshgate::notify::GatewayEvent;
use meshgate::processor::PacketProcessor;
use meshgate::radio::supervisor::{
    ConnectionState, HealthChange, RadioSupervisor, ReconnectOutcome, SupervisorTuning,
};
use meshgate::radio::sync::{ContactSyncRequest, DrainLimits};
use meshgate::radio::{FetchOutcome, RadioEvent};
use meshgate::reconcile::{PendingAcks, PendingRepeats};
use meshgate::storage::{ContactUpdate, GatewayStore, SledStore};
use tokio::sync::mpsc;

const PORT: &str = "/dev/fake0";

fn fast_tuning(port: Option<&str>) -> SupervisorTuning {
    SupervisorTuning {
        port: port.map(str::to_string),
        probe_timeout: Duration::from_millis(500),
        health_interval: Duration::from_millis(20),
        settle_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(20),
        drain: DrainLimits {
            fetch_timeout: Duration::from_millis(50),
            max_iterations: 10,
            pause: Duration::from_millis(1),
        },
        ..SupervisorTuning::default()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SledStore>,
    sink: Arc<RecordingSink>,
    connector: Arc<FakeConnector>,
    supervisor: Arc<RadioSupervisor>,
}

fn harness(connector: Arc<FakeConnector>, tuning: SupervisorTuning) -> Harness {
    let (dir, store) = temp_store();
    let sink = RecordingSink::new();
    let processor = Arc::new(PacketProcessor::new(
        store.clone(),
        sink.clone(),
        Arc::new(PendingAcks::new()),
        Arc::new(PendingRepeats::new()),
    ));
    let supervisor = Arc::new(RadioSupervisor::new(
        connector.clone(),
        processor,
        store.clone(),
        sink.clone(),
        tuning,
    ));
    Harness {
        _dir: dir,
        store,
        sink,
        connector,
        supervisor,
    }
}

#[tokio::test]
async fn session_requires_a_connection() {
    let h = harness(FakeConnector::new(vec![]), fast_tuning(Some(PORT)));
    assert!(matches!(h.supervisor.session(), Err(GatewayError::NotConnected)));
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_dispatches_radio_events() {
    let radio = FakeRadio::new(PORT);
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));

    assert_eq!(h.supervisor.connect().await.expect("connects"), PORT);
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
    assert_eq!(h.supervisor.port().as_deref(), Some(PORT));
    assert!(h.supervisor.session().is_ok());

    radio.push(RadioEvent::RawFrame {
        payload: group_text_frame(&[9u8; 16], 1_700_000_000, "x: y"),
        snr: Some(6.0),
        rssi: Some(-80),
    });
    let store = h.store.clone();
    assert!(
        eventually(Duration::from_secs(2), || store.counts().unwrap().raw_packets == 1).await,
        "raw frame should reach the processor"
    );
}

#[tokio::test]
async fn missing_radio_is_reported_and_retried() {
    let h = harness(FakeConnector::new(vec![]), fast_tuning(None));

    let err = h.supervisor.connect().await.expect_err("nothing to find");
    assert!(!h.supervisor.auto_fetch_enabled());
    assert!(matches!(err, GatewayError::NoRadioFound));
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);

    // still nothing there
    assert_eq!(
        h.supervisor.check_health().await,
        HealthChange::Retried(ReconnectOutcome::Failed)
    );
    assert!(h.sink.kinds().contains(&"error"));

    // discovery probes once, then the session is opened
    let radio = FakeRadio::new(PORT);
    h.connector.add_session(radio.clone());
    h.connector.add_session(radio.clone());
    assert_eq!(
        h.supervisor.check_health().await,
        HealthChange::Retried(ReconnectOutcome::Reconnected)
    );
    assert!(h.supervisor.is_connected());
    assert!(h.supervisor.auto_fetch_enabled(), "a late radio gets auto fetch");
    assert_eq!(h.supervisor.check_health().await, HealthChange::Unchanged);
}

#[tokio::test]
async fn lost_link_reconnects_and_broadcasts_health() {
    let first = FakeRadio::new(PORT);
    let second = FakeRadio::new(PORT);
    let h = harness(
        FakeConnector::new(vec![first.clone(), second.clone()]),
        fast_tuning(Some(PORT)),
    );
    h.supervisor.connect().await.expect("connects");
    assert_eq!(h.supervisor.check_health().await, HealthChange::Unchanged);

    first.set_connected(false);
    assert_eq!(
        h.supervisor.check_health().await,
        HealthChange::Lost(ReconnectOutcome::Reconnected)
    );
    assert!(h.supervisor.is_connected());
    assert_eq!(h.connector.opens(), 2);

    let health: Vec<bool> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            GatewayEvent::Health { radio_connected, .. } => Some(radio_connected),
            _ => None,
        })
        .collect();
    assert_eq!(health, vec![false, true]);
}

#[tokio::test]
async fn failed_reconnect_keeps_retrying() {
    let first = FakeRadio::new(PORT);
    let h = harness(FakeConnector::new(vec![first.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");

    first.set_connected(false);
    assert_eq!(
        h.supervisor.check_health().await,
        HealthChange::Lost(ReconnectOutcome::Failed)
    );
    assert!(matches!(h.supervisor.session(), Err(GatewayError::NotConnected)));

    h.connector.add_session(FakeRadio::new(PORT));
    assert_eq!(
        h.supervisor.check_health().await,
        HealthChange::Retried(ReconnectOutcome::Reconnected)
    );
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn only_one_reconnect_runs_at_a_time() {
    let connector = FakeConnector::with_delay(
        vec![FakeRadio::new(PORT), FakeRadio::new(PORT)],
        Duration::from_millis(100),
    );
    let h = harness(connector, fast_tuning(Some(PORT)));

    let (a, b) = tokio::join!(h.supervisor.reconnect(), h.supervisor.reconnect());
    assert_eq!(a, ReconnectOutcome::Reconnected);
    assert_eq!(b, ReconnectOutcome::AlreadyInProgress);
    assert_eq!(h.connector.opens(), 1);
    assert!(!h.supervisor.is_reconnecting());
}

#[tokio::test]
async fn monitor_recovers_without_intervention() {
    let first = FakeRadio::new(PORT);
    let second = FakeRadio::new(PORT);
    let h = harness(
        FakeConnector::new(vec![first.clone(), second.clone()]),
        fast_tuning(Some(PORT)),
    );
    h.supervisor.connect().await.expect("connects");
    h.supervisor.start_monitor();

    first.set_connected(false);
    let supervisor = h.supervisor.clone();
    assert!(eventually(Duration::from_secs(2), || supervisor.is_connected()).await);
    assert_eq!(h.connector.opens(), 2);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn polling_picks_up_queued_messages() {
    let radio = FakeRadio::new(PORT);
    radio.queue_fetch(Ok(FetchOutcome::Direct(direct_message(
        "aabbccddeeff",
        "queued while away",
        1_700_000_000,
    ))));
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");
    h.supervisor.start_polling();

    let store = h.store.clone();
    assert!(eventually(Duration::from_secs(2), || store.counts().unwrap().messages == 1).await);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn messages_waiting_drains_only_with_auto_fetch() {
    let radio = FakeRadio::new(PORT);
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");

    radio.push(RadioEvent::MessagesWaiting);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(radio.fetch_count(), 0);

    h.supervisor.start_auto_fetch();
    radio.queue_fetch(Ok(FetchOutcome::Direct(direct_message(
        "aabbccddeeff",
        "announced",
        1_700_000_001,
    ))));
    radio.push(RadioEvent::MessagesWaiting);
    let store = h.store.clone();
    assert!(eventually(Duration::from_secs(2), || store.counts().unwrap().messages == 1).await);
}

#[tokio::test]
async fn shutdown_stops_loops_and_disconnects() {
    let radio = FakeRadio::new(PORT);
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");
    h.supervisor.start_monitor();
    h.supervisor.start_polling();
    h.supervisor.start_periodic_sync();
    h.supervisor.start_auto_fetch();

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);
    assert!(!h.supervisor.auto_fetch_enabled());
    assert!(radio.calls().contains(&"disconnect".to_string()));
    assert!(matches!(h.supervisor.session(), Err(GatewayError::NotConnected)));
}

#[tokio::test]
async fn sync_now_offloads_radio_tables() {
    let radio = FakeRadio::new(PORT);
    radio.add_radio_contact(common::radio_contact(&"12".repeat(32), "eve", 1));
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");

    h.supervisor.sync_now().await;
    assert!(radio.radio_contacts().is_empty());
    let contact = h.store.contact_by_key(&"12".repeat(32)).unwrap().expect("offloaded");
    assert!(!contact.on_radio);
    assert!(h.store.channel_by_name("Public").unwrap().is_some());
    assert_eq!(h.sink.count("error"), 0);
}

#[tokio::test]
async fn contact_sync_worker_loads_contacts_and_ignores_lost_link() {
    let radio = FakeRadio::new(PORT);
    let h = harness(FakeConnector::new(vec![radio.clone()]), fast_tuning(Some(PORT)));
    h.supervisor.connect().await.expect("connects");

    let key = "3c".repeat(32);
    let mut update = ContactUpdate::new(&key);
    update.kind = Some(1);
    update.last_contacted = Some(1_700_000_000);
    h.store.upsert_contact(&update).unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    h.supervisor.spawn_contact_sync_worker(rx);
    tx.send(ContactSyncRequest { force: true }).unwrap();
    let store = h.store.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            store.contact_by_key(&key).unwrap().map(|c| c.on_radio).unwrap_or(false)
        })
        .await
    );
    assert_eq!(radio.calls_starting_with("add_contact").len(), 1);

    // link drops before the monitor notices
    radio.set_connected(false);
    tx.send(ContactSyncRequest { force: true }).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.sink.count("error"), 0);
    h.supervisor.shutdown().await;
}
