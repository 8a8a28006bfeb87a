//! Radio connection lifecycle.
//!
//! [`RadioSupervisor`] owns the one active [`RadioSession`]. It connects (with discovery
//! when no port is configured), dispatches session events to the packet processor,
//! watches link health and reconnects, and runs the poll, sync and contact-sync loops.
//! Callers borrow the session for a single operation through [`RadioSupervisor::session`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::sync::{
    drain_pending_messages, poll_for_messages, sync_and_offload_all, ContactSyncRequest,
    ContactSyncer, DrainLimits,
};
use super::{discovery, RadioConnector, RadioEvent, RadioEventHandler, RadioSession};
use crate::errors::GatewayError;
use crate::metrics;
use crate::notify::{EventSink, GatewayEvent};
use crate::storage::GatewayStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Timing and sizing knobs for the supervisor and its loops.
#[derive(Debug, Clone)]
pub struct SupervisorTuning {
    /// Fixed device path; discovery is used when unset.
    pub port: Option<String>,
    /// Handshake bound for probing and opening a device.
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    /// Pause between noticing a lost link and reconnecting.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub drain: DrainLimits,
    pub sync_interval: Duration,
    pub max_radio_contacts: usize,
    pub contact_sync_throttle: Duration,
}

impl Default for SupervisorTuning {
    fn default() -> Self {
        Self {
            port: None,
            probe_timeout: Duration::from_secs(3),
            health_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(5),
            drain: DrainLimits::default(),
            sync_interval: Duration::from_secs(300),
            max_radio_contacts: 200,
            contact_sync_throttle: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected,
    Failed,
    AlreadyInProgress,
}

/// What one health check observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Unchanged,
    /// The link dropped; carries the outcome of the reconnect that followed.
    Lost(ReconnectOutcome),
    /// Another attempt while the link is still down.
    Retried(ReconnectOutcome),
    Restored,
}

struct Link {
    state: ConnectionState,
    session: Option<Arc<dyn RadioSession>>,
    port: Option<String>,
    reconnecting: bool,
    last_connected: bool,
    /// Set while a link is wanted but down.
    lost: bool,
    dispatcher: Option<JoinHandle<()>>,
}

pub struct RadioSupervisor {
    connector: Arc<dyn RadioConnector>,
    handler: Arc<dyn RadioEventHandler>,
    store: Arc<dyn GatewayStore>,
    sink: Arc<dyn EventSink>,
    tuning: SupervisorTuning,
    link: Mutex<Link>,
    auto_fetch: Arc<AtomicBool>,
    contact_syncer: ContactSyncer,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RadioSupervisor {
    pub fn new(
        connector: Arc<dyn RadioConnector>,
        handler: Arc<dyn RadioEventHandler>,
        store: Arc<dyn GatewayStore>,
        sink: Arc<dyn EventSink>,
        tuning: SupervisorTuning,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let contact_syncer =
            ContactSyncer::new(tuning.max_radio_contacts, tuning.contact_sync_throttle);
        Self {
            connector,
            handler,
            store,
            sink,
            tuning,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                session: None,
                port: None,
                reconnecting: false,
                last_connected: false,
                lost: false,
                dispatcher: None,
            }),
            auto_fetch: Arc::new(AtomicBool::new(false)),
            contact_syncer,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tuning(&self) -> &SupervisorTuning {
        &self.tuning
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().unwrap().state
    }

    /// Device path of the current (or last) session.
    pub fn port(&self) -> Option<String> {
        self.link.lock().unwrap().port.clone()
    }

    pub fn is_connected(&self) -> bool {
        let link = self.link.lock().unwrap();
        link.session.as_ref().map(|s| s.is_connected()).unwrap_or(false)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.link.lock().unwrap().reconnecting
    }

    /// The live session, for one operation.
    pub fn session(&self) -> Result<Arc<dyn RadioSession>, GatewayError> {
        let link = self.link.lock().unwrap();
        match &link.session {
            Some(session) if session.is_connected() => Ok(Arc::clone(session)),
            _ => Err(GatewayError::NotConnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.link.lock().unwrap().state = state;
    }

    /// Drop the current session and its dispatcher.
    async fn teardown(&self) {
        let (session, dispatcher) = {
            let mut link = self.link.lock().unwrap();
            (link.session.take(), link.dispatcher.take())
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    /// Open a session on the configured port, or the first discovered radio.
    pub async fn connect(&self) -> Result<String, GatewayError> {
        self.teardown().await;
        self.set_state(ConnectionState::Connecting);

        let result = self.open_session().await;
        let mut link = self.link.lock().unwrap();
        match result {
            Ok((path, session)) => {
                link.dispatcher = Some(spawn_dispatcher(
                    Arc::clone(&session),
                    Arc::clone(&self.handler),
                    Arc::clone(&self.auto_fetch),
                    self.tuning.drain,
                ));
                link.session = Some(session);
                link.port = Some(path.clone());
                link.state = ConnectionState::Connected;
                link.last_connected = true;
                link.lost = false;
                info!("Radio connected on {}", path);
                Ok(path)
            }
            Err(e) => {
                link.state = ConnectionState::Disconnected;
                link.lost = true;
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<(String, Arc<dyn RadioSession>), GatewayError> {
        let path = match &self.tuning.port {
            Some(port) => {
                debug!("Connecting to configured port {}", port);
                port.clone()
            }
            None => {
                info!("No port configured, auto-detecting radio");
                discovery::find_radio_port(self.connector.as_ref(), self.tuning.probe_timeout)
                    .await
                    .ok_or(GatewayError::NoRadioFound)?
            }
        };
        let session = self
            .connector
            .open(&path, self.tuning.probe_timeout)
            .await?;
        Ok((path, session))
    }

    /// Replace the session. Only one reconnect runs at a time.
    pub async fn reconnect(&self) -> ReconnectOutcome {
        {
            let mut link = self.link.lock().unwrap();
            if link.reconnecting {
                debug!("Reconnection already in progress");
                return ReconnectOutcome::AlreadyInProgress;
            }
            link.reconnecting = true;
            link.state = ConnectionState::Reconnecting;
        }
        metrics::inc_reconnect_attempts();
        info!("Attempting to reconnect to radio");

        let result = self.connect().await;
        self.link.lock().unwrap().reconnecting = false;

        match result {
            Ok(path) => {
                if !self.auto_fetch.swap(true, Ordering::SeqCst) {
                    info!("Auto message fetching enabled");
                }
                info!("Radio reconnected successfully at {}", path);
                self.sink.publish(GatewayEvent::health(true, Some(path)));
                ReconnectOutcome::Reconnected
            }
            Err(e) => {
                metrics::inc_reconnect_failures();
                warn!("Reconnection failed: {}", e);
                self.sink
                    .publish(GatewayEvent::error("Reconnection failed", Some(e.to_string())));
                ReconnectOutcome::Failed
            }
        }
    }

    /// One health monitor tick.
    pub async fn check_health(&self) -> HealthChange {
        let current = self.is_connected();
        let (last, lost, reconnecting, port) = {
            let link = self.link.lock().unwrap();
            (link.last_connected, link.lost, link.reconnecting, link.port.clone())
        };

        if last && !current {
            warn!("Radio connection lost, broadcasting status change");
            self.sink.publish(GatewayEvent::health(false, port));
            {
                let mut link = self.link.lock().unwrap();
                link.last_connected = false;
                link.lost = true;
                if !link.reconnecting {
                    link.state = ConnectionState::Disconnected;
                }
            }
            tokio::time::sleep(self.tuning.settle_delay).await;
            HealthChange::Lost(self.reconnect().await)
        } else if !last && current {
            info!("Radio connection restored");
            self.sink.publish(GatewayEvent::health(true, port));
            let mut link = self.link.lock().unwrap();
            link.last_connected = true;
            link.lost = false;
            HealthChange::Restored
        } else if lost && !current && !reconnecting {
            HealthChange::Retried(self.reconnect().await)
        } else {
            HealthChange::Unchanged
        }
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    /// Periodic health checks with reconnect.
    pub fn start_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.tuning.health_interval;
        self.push_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        this.check_health().await;
                    }
                }
            }
            debug!("Connection monitor stopped");
        }));
        info!("Radio connection monitor started");
    }

    /// Fallback polling for messages the radio did not announce.
    pub fn start_polling(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.tuning.poll_interval;
        self.push_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Ok(session) = this.session() {
                            let count = poll_for_messages(
                                session.as_ref(),
                                this.handler.as_ref(),
                                this.tuning.drain,
                            )
                            .await;
                            if count > 0 {
                                info!("Poll loop found {} message(s)", count);
                            }
                        }
                    }
                }
            }
            debug!("Message polling stopped");
        }));
        info!(
            "Started periodic message polling (interval: {}s)",
            self.tuning.poll_interval.as_secs()
        );
    }

    /// Periodic contact and channel offload.
    pub fn start_periodic_sync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.tuning.sync_interval;
        self.push_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        this.sync_now().await;
                    }
                }
            }
            debug!("Periodic sync stopped");
        }));
        info!(
            "Started periodic radio sync (interval: {}s)",
            self.tuning.sync_interval.as_secs()
        );
    }

    /// Full offload now; failures are reported as error notifications.
    pub async fn sync_now(&self) {
        let session = match self.session() {
            Ok(session) => session,
            Err(_) => {
                debug!("Skipping sync, radio not connected");
                return;
            }
        };
        let report = sync_and_offload_all(session.as_ref(), self.store.as_ref()).await;
        if !report.errors.is_empty() {
            error!("Periodic sync had errors: {}", report.errors.join("; "));
            self.sink.publish(GatewayEvent::error(
                "Radio sync failed",
                Some(report.errors.join("; ")),
            ));
        }
    }

    /// Serve contact sync requests raised by the packet processor.
    pub fn spawn_contact_sync_worker(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<ContactSyncRequest>,
    ) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.push_task(tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.changed() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let Ok(session) = this.session() else {
                    continue;
                };
                match this
                    .contact_syncer
                    .sync_recent_contacts_to_radio(session.as_ref(), this.store.as_ref(), request.force)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_connectivity() => {
                        debug!("Contact sync skipped, radio link down: {}", e);
                    }
                    Err(e) => {
                        warn!("Contact sync to radio failed: {}", e);
                        this.sink.publish(GatewayEvent::error(
                            "Contact sync failed",
                            Some(e.to_string()),
                        ));
                    }
                }
            }
            debug!("Contact sync worker stopped");
        }));
    }

    pub fn contact_syncer(&self) -> &ContactSyncer {
        &self.contact_syncer
    }

    pub fn start_auto_fetch(&self) {
        self.auto_fetch.store(true, Ordering::SeqCst);
        info!("Auto message fetching enabled");
    }

    pub fn stop_auto_fetch(&self) {
        self.auto_fetch.store(false, Ordering::SeqCst);
        debug!("Auto message fetching disabled");
    }

    pub fn auto_fetch_enabled(&self) -> bool {
        self.auto_fetch.load(Ordering::SeqCst)
    }

    /// Stop the loops, wait for them, then close the session.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        self.stop_auto_fetch();
        self.teardown().await;
        let mut link = self.link.lock().unwrap();
        link.state = ConnectionState::Disconnected;
        link.last_connected = false;
        info!("Radio supervisor stopped");
    }
}

/// Forward session events to the handler, one task per event.
fn spawn_dispatcher(
    session: Arc<dyn RadioSession>,
    handler: Arc<dyn RadioEventHandler>,
    auto_fetch: Arc<AtomicBool>,
    drain: DrainLimits,
) -> JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event dispatcher lagged, {} radio events dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                RadioEvent::MessagesWaiting => {
                    if !auto_fetch.load(Ordering::SeqCst) {
                        continue;
                    }
                    let session = Arc::clone(&session);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let count =
                            drain_pending_messages(session.as_ref(), handler.as_ref(), drain).await;
                        debug!("Fetched {} waiting message(s)", count);
                    });
                }
                event => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        handler.handle_event(event).await;
                    });
                }
            }
        }
        debug!("Event dispatcher for {} stopped", session.device_path());
    })
}
