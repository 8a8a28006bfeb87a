//! Wiring and lifecycle of a running gateway.
//!
//! [`Gateway::start`] brings the radio up in a fixed order: connect, offload the radio's
//! contacts and channels, start periodic sync, advertise, enable auto fetching, drain
//! queued messages, start polling. A failing step is logged and the rest still run. The
//! connection monitor always starts, so a gateway started without a radio attaches one
//! once it appears.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::errors::GatewayError;
use crate::metrics;
use crate::notify::{EventBus, EventSink, GatewayEvent};
use crate::outbox::Outbox;
use crate::processor::{HistoricalDecryptor, PacketProcessor};
use crate::radio::supervisor::{RadioSupervisor, SupervisorTuning};
use crate::radio::sync::{
    drain_pending_messages, ensure_default_channels, sync_and_offload_all, ContactSyncRequest,
    SyncReport,
};
use crate::radio::RadioConnector;
use crate::reconcile::{PendingAcks, PendingRepeats};
use crate::storage::GatewayStore;

/// What happened during [`Gateway::start`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub port: Option<String>,
    pub sync: Option<SyncReport>,
    pub advert_sent: bool,
    pub drained: usize,
}

pub struct Gateway {
    store: Arc<dyn GatewayStore>,
    bus: EventBus,
    processor: Arc<PacketProcessor>,
    supervisor: Arc<RadioSupervisor>,
    outbox: Outbox,
    historical: Arc<HistoricalDecryptor>,
    contact_sync_rx: Mutex<Option<mpsc::UnboundedReceiver<ContactSyncRequest>>>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        connector: Arc<dyn RadioConnector>,
        tuning: SupervisorTuning,
    ) -> Self {
        Self::with_bus(store, connector, tuning, EventBus::new())
    }

    pub fn with_bus(
        store: Arc<dyn GatewayStore>,
        connector: Arc<dyn RadioConnector>,
        tuning: SupervisorTuning,
        bus: EventBus,
    ) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(bus.clone());
        let acks = Arc::new(PendingAcks::new());
        let repeats = Arc::new(PendingRepeats::new());
        let (contact_sync_tx, contact_sync_rx) = mpsc::unbounded_channel();

        let processor = Arc::new(
            PacketProcessor::new(
                Arc::clone(&store),
                Arc::clone(&sink),
                Arc::clone(&acks),
                Arc::clone(&repeats),
            )
            .with_contact_sync(contact_sync_tx),
        );
        let supervisor = Arc::new(RadioSupervisor::new(
            connector,
            processor.clone(),
            Arc::clone(&store),
            Arc::clone(&sink),
            tuning,
        ));
        let outbox = Outbox::new(
            Arc::clone(&supervisor),
            Arc::clone(&store),
            sink,
            acks,
            repeats,
        );
        let historical = Arc::new(HistoricalDecryptor::new(Arc::clone(&processor)));

        Self {
            store,
            bus,
            processor,
            supervisor,
            outbox,
            historical,
            contact_sync_rx: Mutex::new(Some(contact_sync_rx)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.bus.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<PacketProcessor> {
        &self.processor
    }

    pub fn supervisor(&self) -> &Arc<RadioSupervisor> {
        &self.supervisor
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn historical(&self) -> &Arc<HistoricalDecryptor> {
        &self.historical
    }

    /// Connect and start every background loop.
    pub async fn start(&self) -> StartupReport {
        let mut report = StartupReport::default();
        if let Err(e) = ensure_default_channels(self.store.as_ref()) {
            warn!("Could not create default channels: {}", e);
        }

        match self.supervisor.connect().await {
            Ok(port) => {
                info!("Connected to radio");
                report.port = Some(port);
                self.bring_up(&mut report).await;
            }
            Err(e) => {
                warn!("Failed to connect to radio on startup: {}", e);
                // loops idle until the monitor attaches a radio
                self.supervisor.start_periodic_sync();
                self.supervisor.start_polling();
            }
        }

        if let Some(rx) = self.contact_sync_rx.lock().unwrap().take() {
            self.supervisor.spawn_contact_sync_worker(rx);
        }
        self.supervisor.start_monitor();
        report
    }

    async fn bring_up(&self, report: &mut StartupReport) {
        let session = match self.supervisor.session() {
            Ok(session) => session,
            Err(e) => {
                warn!("Radio dropped during startup: {}", e);
                return;
            }
        };

        info!("Syncing and offloading radio data...");
        let sync = sync_and_offload_all(session.as_ref(), self.store.as_ref()).await;
        info!(
            "Sync complete: {}",
            serde_json::to_string(&sync).unwrap_or_default()
        );
        report.sync = Some(sync);

        self.supervisor.start_periodic_sync();

        info!("Sending startup advertisement...");
        match session.send_advert(true).await {
            Ok(()) => report.advert_sent = true,
            Err(e) => warn!("Startup advertisement failed: {}", e),
        }

        self.supervisor.start_auto_fetch();

        report.drained = drain_pending_messages(
            session.as_ref(),
            self.processor.as_ref(),
            self.supervisor.tuning().drain,
        )
        .await;
        if report.drained > 0 {
            info!("Drained {} pending message(s)", report.drained);
        }

        self.supervisor.start_polling();
    }

    /// Stop loops and the radio link, then log the counters.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.supervisor.shutdown().await;
        let snapshot = metrics::snapshot();
        info!(
            "Final metrics: {}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );
    }

    /// Start, wait for ctrl-c, shut down.
    pub async fn run_until_ctrl_c(&self) -> Result<StartupReport, GatewayError> {
        let report = self.start().await;
        info!("Gateway running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        self.shutdown().await;
        Ok(report)
    }
}
