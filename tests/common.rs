//! Test utilities & fixtures: a scripted in-memory radio, a recording event sink and
//! throwaway sled stores.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use meshgate::codec::{encrypt_group_text, header_byte, PayloadType, RouteType};
use meshgate::logutil::short_key;
use meshgate::notify::{EventSink, GatewayEvent};
use meshgate::radio::{
    ChannelSlot, ContactMessage, FetchOutcome, RadioConnector, RadioContact, RadioError,
    RadioEvent, RadioSession, RepeaterQuery, SelfInfo, SentReceipt,
};
use meshgate::storage::{SledStore, SledStoreBuilder};

/// Slots the fake radio pretends to have; higher indexes answer with an error.
pub const FAKE_CHANNEL_SLOTS: u8 = 8;
pub const FAKE_ACK_CODE: &str = "a1b2c3d4";

pub fn temp_store() -> (TempDir, Arc<SledStore>) {
    let dir = TempDir::new().expect("tempdir");
    let store = SledStoreBuilder::new(dir.path().join("db"))
        .temporary()
        .open()
        .expect("open store");
    (dir, Arc::new(store))
}

/// A flood-routed GroupText frame as a radio would hear it.
pub fn group_text_frame(key: &[u8; 16], timestamp: u32, text: &str) -> Vec<u8> {
    let mut frame = vec![
        header_byte(RouteType::Flood, PayloadType::GroupText, 0),
        0x00,
    ];
    frame.extend_from_slice(&encrypt_group_text(key, timestamp, 0, text));
    frame
}

pub fn radio_contact(public_key: &str, name: &str, kind: u8) -> RadioContact {
    RadioContact {
        public_key: public_key.to_string(),
        kind,
        flags: 0,
        out_path_len: -1,
        out_path: String::new(),
        name: name.to_string(),
        last_advert: 1_700_000_000,
        lat: 0.0,
        lon: 0.0,
        last_modified: 0,
    }
}

pub fn direct_message(prefix: &str, text: &str, sender_timestamp: u32) -> ContactMessage {
    ContactMessage {
        pubkey_prefix: prefix.to_string(),
        path_len: Some(1),
        txt_type: 0,
        sender_timestamp,
        text: text.to_string(),
        signature: None,
        snr: None,
    }
}

#[derive(Default)]
struct FakeState {
    contacts: Vec<RadioContact>,
    channels: HashMap<u8, ChannelSlot>,
    fetch_queue: VecDeque<Result<FetchOutcome, RadioError>>,
    repeater_responses: VecDeque<Result<Vec<u8>, RadioError>>,
    calls: Vec<String>,
}

/// In-memory [`RadioSession`] with scripted answers and a call log.
pub struct FakeRadio {
    path: String,
    info: SelfInfo,
    connected: AtomicBool,
    events: broadcast::Sender<RadioEvent>,
    state: Mutex<FakeState>,
    fetches: AtomicUsize,
    /// Every fetch returns a message instead of draining the queue.
    endless: AtomicBool,
    fail_add_contact: AtomicBool,
}

impl FakeRadio {
    pub fn new(path: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            path: path.to_string(),
            info: SelfInfo {
                public_key: "f0".repeat(32),
                name: "gateway".into(),
                adv_type: 1,
                tx_power: 22,
                lat: 0.0,
                lon: 0.0,
            },
            connected: AtomicBool::new(true),
            events,
            state: Mutex::new(FakeState::default()),
            fetches: AtomicUsize::new(0),
            endless: AtomicBool::new(false),
            fail_add_contact: AtomicBool::new(false),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_endless(&self, endless: bool) {
        self.endless.store(endless, Ordering::SeqCst);
    }

    pub fn fail_add_contact(&self, fail: bool) {
        self.fail_add_contact.store(fail, Ordering::SeqCst);
    }

    pub fn add_radio_contact(&self, contact: RadioContact) {
        self.state.lock().unwrap().contacts.push(contact);
    }

    pub fn radio_contacts(&self) -> Vec<RadioContact> {
        self.state.lock().unwrap().contacts.clone()
    }

    pub fn put_channel(&self, slot: ChannelSlot) {
        self.state.lock().unwrap().channels.insert(slot.index, slot);
    }

    pub fn channel(&self, index: u8) -> Option<ChannelSlot> {
        self.state.lock().unwrap().channels.get(&index).cloned()
    }

    pub fn queue_fetch(&self, outcome: Result<FetchOutcome, RadioError>) {
        self.state.lock().unwrap().fetch_queue.push_back(outcome);
    }

    pub fn queue_repeater_response(&self, response: Result<Vec<u8>, RadioError>) {
        self.state
            .lock()
            .unwrap()
            .repeater_responses
            .push_back(response);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Deliver a push event to every subscriber.
    pub fn push(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn check(&self) -> Result<(), RadioError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RadioError::Disconnected)
        }
    }
}

#[async_trait]
impl RadioSession for FakeRadio {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn self_info(&self) -> &SelfInfo {
        &self.info
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn send_direct_message(
        &self,
        contact: &RadioContact,
        text: &str,
        timestamp: u32,
    ) -> Result<SentReceipt, RadioError> {
        self.check()?;
        self.record(format!("send_direct:{}:{}:{}", contact.key_prefix(), text, timestamp));
        Ok(SentReceipt {
            expected_ack: FAKE_ACK_CODE.into(),
            suggested_timeout: Duration::from_secs(5),
            flood: false,
        })
    }

    async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
        timestamp: u32,
    ) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("send_channel:{}:{}:{}", slot, text, timestamp));
        Ok(())
    }

    async fn fetch_next_message(&self, _timeout: Duration) -> Result<FetchOutcome, RadioError> {
        self.check()?;
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.endless.load(Ordering::SeqCst) {
            return Ok(FetchOutcome::Direct(direct_message(
                "0102030405ff",
                &format!("flood {}", n),
                1_700_000_000 + n as u32,
            )));
        }
        self.state
            .lock()
            .unwrap()
            .fetch_queue
            .pop_front()
            .unwrap_or(Ok(FetchOutcome::NoMore))
    }

    async fn repeater_request(
        &self,
        contact: &RadioContact,
        query: RepeaterQuery,
        _timeout: Duration,
        _min_timeout: Duration,
    ) -> Result<Vec<u8>, RadioError> {
        self.check()?;
        self.record(format!("repeater:{}:{:?}", contact.key_prefix(), query));
        self.state
            .lock()
            .unwrap()
            .repeater_responses
            .pop_front()
            .unwrap_or(Err(RadioError::Timeout))
    }

    async fn add_contact(&self, contact: &RadioContact) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("add_contact:{}", contact.key_prefix()));
        if self.fail_add_contact.load(Ordering::SeqCst) {
            return Err(RadioError::CommandFailed { code: 3 });
        }
        let mut state = self.state.lock().unwrap();
        state.contacts.retain(|c| c.public_key != contact.public_key);
        state.contacts.push(contact.clone());
        Ok(())
    }

    async fn remove_contact(&self, public_key: &str) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("remove_contact:{}", short_key(public_key)));
        self.state
            .lock()
            .unwrap()
            .contacts
            .retain(|c| c.public_key != public_key);
        Ok(())
    }

    async fn get_contacts(&self) -> Result<Vec<RadioContact>, RadioError> {
        self.check()?;
        Ok(self.radio_contacts())
    }

    async fn get_channel(&self, index: u8) -> Result<Option<ChannelSlot>, RadioError> {
        self.check()?;
        if index >= FAKE_CHANNEL_SLOTS {
            return Err(RadioError::CommandFailed { code: 2 });
        }
        Ok(Some(
            self.channel(index)
                .unwrap_or_else(|| ChannelSlot::cleared(index)),
        ))
    }

    async fn set_channel(&self, slot: &ChannelSlot) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("set_channel:{}:{}", slot.index, slot.name));
        let mut state = self.state.lock().unwrap();
        if slot.is_empty() {
            state.channels.remove(&slot.index);
        } else {
            state.channels.insert(slot.index, slot.clone());
        }
        Ok(())
    }

    async fn send_advert(&self, flood: bool) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("advert:{}", flood));
        Ok(())
    }

    async fn import_private_key(&self, key: &[u8]) -> Result<(), RadioError> {
        self.check()?;
        self.record(format!("import_key:{}", key.len()));
        Ok(())
    }

    async fn reboot(&self) -> Result<(), RadioError> {
        self.check()?;
        self.record("reboot".into());
        Ok(())
    }

    async fn disconnect(&self) {
        self.record("disconnect".into());
        self.set_connected(false);
    }
}

/// Hands out scripted sessions in order; fails once the script runs out.
pub struct FakeConnector {
    sessions: Mutex<VecDeque<Arc<FakeRadio>>>,
    paths: Vec<String>,
    opens: AtomicUsize,
    open_delay: Duration,
}

impl FakeConnector {
    pub fn new(sessions: Vec<Arc<FakeRadio>>) -> Arc<Self> {
        Self::with_delay(sessions, Duration::ZERO)
    }

    pub fn with_delay(sessions: Vec<Arc<FakeRadio>>, open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into_iter().collect()),
            paths: vec!["/dev/fake0".into()],
            opens: AtomicUsize::new(0),
            open_delay,
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn add_session(&self, session: Arc<FakeRadio>) {
        self.sessions.lock().unwrap().push_back(session);
    }
}

#[async_trait]
impl RadioConnector for FakeConnector {
    async fn open(
        &self,
        _path: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn RadioSession>, RadioError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(session) => {
                session.set_connected(true);
                Ok(session)
            }
            None => Err(RadioError::Serial("no device".into())),
        }
    }

    fn candidate_paths(&self) -> Vec<String> {
        self.paths.clone()
    }
}

/// Keeps every published event for inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: GatewayEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
