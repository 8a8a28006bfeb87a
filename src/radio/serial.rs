//! MeshCore companion protocol over a serial port.
//!
//! A blocking reader thread owns a clone of the port. It decodes frames and routes
//! them: push codes (0x80 and up) become [`RadioEvent`]s on a broadcast channel,
//! everything else is a command response. Commands are serialized through an async
//! mutex around the response receiver so a response always belongs to the command
//! that holds the lock.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serialport::SerialPort;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

use super::frame::{encode_frame, FrameDecoder};
use super::{
    discovery, ChannelMessage, ChannelSlot, ContactMessage, FetchOutcome, RadioConnector,
    RadioContact, RadioError, RadioEvent, RadioSession, RepeaterQuery, SelfInfo, SentReceipt,
    MAX_PATH_LEN,
};
use crate::logutil::hex_snippet;

const CMD_APP_START: u8 = 1;
const CMD_SEND_TXT_MSG: u8 = 2;
const CMD_SEND_CHANNEL_TXT_MSG: u8 = 3;
const CMD_GET_CONTACTS: u8 = 4;
const CMD_SEND_SELF_ADVERT: u8 = 7;
const CMD_ADD_UPDATE_CONTACT: u8 = 9;
const CMD_SYNC_NEXT_MESSAGE: u8 = 10;
const CMD_REMOVE_CONTACT: u8 = 15;
const CMD_REBOOT: u8 = 19;
const CMD_IMPORT_PRIVATE_KEY: u8 = 24;
const CMD_GET_CHANNEL: u8 = 31;
const CMD_SET_CHANNEL: u8 = 32;
const CMD_SEND_BINARY_REQ: u8 = 50;

const RESP_OK: u8 = 0;
const RESP_ERR: u8 = 1;
const RESP_CONTACTS_START: u8 = 2;
const RESP_CONTACT: u8 = 3;
const RESP_END_OF_CONTACTS: u8 = 4;
const RESP_SELF_INFO: u8 = 5;
const RESP_SENT: u8 = 6;
const RESP_CONTACT_MSG_RECV: u8 = 7;
const RESP_CHANNEL_MSG_RECV: u8 = 8;
const RESP_NO_MORE_MESSAGES: u8 = 10;
const RESP_CONTACT_MSG_RECV_V3: u8 = 16;
const RESP_CHANNEL_MSG_RECV_V3: u8 = 17;
const RESP_CHANNEL_INFO: u8 = 18;

const PUSH_ADVERT: u8 = 0x80;
const PUSH_PATH_UPDATED: u8 = 0x81;
const PUSH_SEND_CONFIRMED: u8 = 0x82;
const PUSH_MSG_WAITING: u8 = 0x83;
const PUSH_LOG_RX_DATA: u8 = 0x88;
const PUSH_NEW_ADVERT: u8 = 0x8A;
const PUSH_BINARY_RESPONSE: u8 = 0x8C;

const APP_PROTOCOL_VERSION: u8 = 3;
const APP_NAME: &[u8] = b"mccli";
const NAME_LEN: usize = 32;
const TXT_TYPE_SIGNED: u8 = 2;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;
const EVENT_CAPACITY: usize = 256;

/// Little-endian cursor over a response frame.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RadioError> {
        if self.pos + n > self.buf.len() {
            return Err(RadioError::UnexpectedResponse(format!(
                "frame of {} bytes ended at field offset {}",
                self.buf.len(),
                self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RadioError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, RadioError> {
        Ok(self.u8()? as i8)
    }

    fn u32(&mut self) -> Result<u32, RadioError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, RadioError> {
        Ok(self.u32()? as i32)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        out
    }
}

/// NUL padded fixed-width string field.
fn padded_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn put_padded(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let mut n = bytes.len().min(width - 1);
    while n > 0 && !text.is_char_boundary(n) {
        n -= 1;
    }
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (width - n), 0);
}

fn check_code(frame: &[u8], expected: u8) -> Result<(), RadioError> {
    match frame.first() {
        Some(code) if *code == expected => Ok(()),
        Some(&RESP_ERR) => Err(RadioError::CommandFailed {
            code: frame.get(1).copied().unwrap_or(0),
        }),
        Some(code) => Err(RadioError::UnexpectedResponse(format!(
            "expected response {} but got {}",
            expected, code
        ))),
        None => Err(RadioError::UnexpectedResponse("empty frame".into())),
    }
}

fn parse_self_info(frame: &[u8]) -> Result<SelfInfo, RadioError> {
    check_code(frame, RESP_SELF_INFO)?;
    let mut r = FieldReader::new(&frame[1..]);
    let adv_type = r.u8()?;
    let tx_power = r.u8()?;
    let _max_tx_power = r.u8()?;
    let public_key = hex::encode(r.take(32)?);
    let lat = f64::from(r.i32()?) / 1e6;
    let lon = f64::from(r.i32()?) / 1e6;
    // flags, radio frequency, bandwidth, spreading factor, coding rate
    let _ = r.take(4 + 4 + 4 + 1 + 1)?;
    let name = padded_str(r.rest());
    Ok(SelfInfo {
        public_key,
        name,
        adv_type,
        tx_power,
        lat,
        lon,
    })
}

/// Contact record as carried by CONTACT responses and NEW_ADVERT pushes (code stripped).
fn parse_contact_record(body: &[u8]) -> Result<RadioContact, RadioError> {
    let mut r = FieldReader::new(body);
    let public_key = hex::encode(r.take(32)?);
    let kind = r.u8()?;
    let flags = r.u8()?;
    let out_path_len = i32::from(r.i8()?);
    let path_bytes = r.take(MAX_PATH_LEN)?;
    let used = usize::try_from(out_path_len).unwrap_or(0).min(MAX_PATH_LEN);
    let name = padded_str(r.take(NAME_LEN)?);
    let last_advert = r.u32()?;
    let lat = f64::from(r.i32()?) / 1e6;
    let lon = f64::from(r.i32()?) / 1e6;
    let last_modified = r.u32().unwrap_or(0);
    Ok(RadioContact {
        public_key,
        kind,
        flags,
        out_path_len,
        out_path: hex::encode(&path_bytes[..used]),
        name,
        last_advert,
        lat,
        lon,
        last_modified,
    })
}

fn encode_contact(contact: &RadioContact) -> Result<Vec<u8>, RadioError> {
    let key = hex::decode(&contact.public_key)
        .map_err(|e| RadioError::UnexpectedResponse(format!("bad public key: {}", e)))?;
    if key.len() != 32 {
        return Err(RadioError::UnexpectedResponse("public key must be 32 bytes".into()));
    }
    let path = hex::decode(&contact.out_path).unwrap_or_default();

    let mut out = Vec::with_capacity(144);
    out.push(CMD_ADD_UPDATE_CONTACT);
    out.extend_from_slice(&key);
    out.push(contact.kind);
    out.push(contact.flags);
    out.push(contact.out_path_len.clamp(-1, MAX_PATH_LEN as i32) as i8 as u8);
    let mut path_field = path;
    path_field.resize(MAX_PATH_LEN, 0);
    out.extend_from_slice(&path_field);
    put_padded(&mut out, &contact.name, NAME_LEN);
    out.extend_from_slice(&contact.last_advert.to_le_bytes());
    out.extend_from_slice(&((contact.lat * 1e6) as i32).to_le_bytes());
    out.extend_from_slice(&((contact.lon * 1e6) as i32).to_le_bytes());
    Ok(out)
}

fn parse_contact_message(frame: &[u8]) -> Result<ContactMessage, RadioError> {
    let v3 = frame[0] == RESP_CONTACT_MSG_RECV_V3;
    let mut r = FieldReader::new(&frame[1..]);
    let snr = if v3 {
        let snr = f32::from(r.i8()?) / 4.0;
        r.take(2)?;
        Some(snr)
    } else {
        None
    };
    let pubkey_prefix = hex::encode(r.take(6)?);
    let path_len = r.u8()?;
    let txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    let signature = if txt_type == TXT_TYPE_SIGNED {
        Some(hex::encode(r.take(4)?))
    } else {
        None
    };
    let text = String::from_utf8_lossy(r.rest()).trim_end_matches('\0').to_string();
    Ok(ContactMessage {
        pubkey_prefix,
        path_len: (path_len != 0xFF).then_some(i32::from(path_len)),
        txt_type,
        sender_timestamp,
        text,
        signature,
        snr,
    })
}

fn parse_channel_message(frame: &[u8]) -> Result<ChannelMessage, RadioError> {
    let v3 = frame[0] == RESP_CHANNEL_MSG_RECV_V3;
    let mut r = FieldReader::new(&frame[1..]);
    if v3 {
        r.take(3)?;
    }
    let channel_index = r.u8()?;
    let path_len = r.u8()?;
    let txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    let text = String::from_utf8_lossy(r.rest()).trim_end_matches('\0').to_string();
    Ok(ChannelMessage {
        channel_index,
        path_len: (path_len != 0xFF).then_some(i32::from(path_len)),
        txt_type,
        sender_timestamp,
        text,
    })
}

#[derive(Debug, PartialEq)]
enum Push {
    Event(RadioEvent),
    Binary { tag: u32, data: Vec<u8> },
}

/// Translate an unsolicited frame. Unknown or malformed pushes yield `None`.
fn decode_push(frame: &[u8]) -> Option<Push> {
    let (&code, body) = frame.split_first()?;
    let mut r = FieldReader::new(body);
    let push = match code {
        PUSH_ADVERT => Push::Event(RadioEvent::Advert {
            public_key: hex::encode(r.take(32).ok()?),
        }),
        PUSH_PATH_UPDATED => Push::Event(RadioEvent::PathUpdate {
            public_key: hex::encode(r.take(32).ok()?),
            path: None,
            path_len: -1,
        }),
        PUSH_SEND_CONFIRMED => Push::Event(RadioEvent::Ack {
            code: hex::encode(r.take(4).ok()?),
        }),
        PUSH_MSG_WAITING => Push::Event(RadioEvent::MessagesWaiting),
        PUSH_LOG_RX_DATA => {
            let snr = f32::from(r.i8().ok()?) / 4.0;
            let rssi = i16::from(r.i8().ok()?);
            let payload = r.rest().to_vec();
            if payload.is_empty() {
                return None;
            }
            Push::Event(RadioEvent::RawFrame {
                payload,
                snr: Some(snr),
                rssi: Some(rssi),
            })
        }
        PUSH_NEW_ADVERT => Push::Event(RadioEvent::NewContact(parse_contact_record(body).ok()?)),
        PUSH_BINARY_RESPONSE => {
            r.take(1).ok()?;
            let tag = r.u32().ok()?;
            Push::Binary {
                tag,
                data: r.rest().to_vec(),
            }
        }
        _ => return None,
    };
    Some(push)
}

/// Routes decoded frames from the reader thread.
struct Router {
    responses: mpsc::UnboundedSender<Vec<u8>>,
    binary: mpsc::UnboundedSender<(u32, Vec<u8>)>,
    events: broadcast::Sender<RadioEvent>,
}

impl Router {
    fn route(&self, frame: Vec<u8>) {
        trace!("RX frame {}", hex_snippet(&frame, 32));
        if frame.first().map(|c| *c < PUSH_ADVERT).unwrap_or(true) {
            let _ = self.responses.send(frame);
            return;
        }
        match decode_push(&frame) {
            Some(Push::Event(event)) => {
                let _ = self.events.send(event);
            }
            Some(Push::Binary { tag, data }) => {
                let _ = self.binary.send((tag, data));
            }
            None => debug!("Ignoring push 0x{:02X}", frame[0]),
        }
    }
}

fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    router: Router,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    path: String,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("meshcore-reader".into())
        .spawn(move || {
            let mut decoder = FrameDecoder::new();
            let mut buffer = [0u8; 512];
            let mut errors = 0u32;
            while !stop.load(Ordering::Relaxed) {
                match port.read(&mut buffer) {
                    Ok(n) if n > 0 => {
                        errors = 0;
                        decoder.push(&buffer[..n]);
                        while let Some(frame) = decoder.next_frame() {
                            router.route(frame);
                        }
                    }
                    Ok(_) => {}
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        errors += 1;
                        warn!("Serial read error on {} (continuing): {}", path, e);
                        if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            warn!("Serial link {} lost after {} read errors", path, errors);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!("Reader for {} stopped", path);
        })
}

/// Opens [`SerialSession`]s at a fixed baud rate.
pub struct SerialConnector {
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    async fn open_port(&self, path: &str) -> Result<Box<dyn SerialPort>, RadioError> {
        let mut builder = serialport::new(path, self.baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder
            .open()
            .map_err(|e| RadioError::Serial(format!("failed to open {}: {}", path, e)))?;
        // wake ESP32 style boards
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(port)
    }
}

#[async_trait]
impl RadioConnector for SerialConnector {
    async fn open(&self, path: &str, timeout: Duration) -> Result<Arc<dyn RadioSession>, RadioError> {
        info!("Opening MeshCore radio on {} at {} baud", path, self.baud_rate);
        let port = self.open_port(path).await?;
        let reader_port = port
            .try_clone()
            .map_err(|e| RadioError::Serial(format!("failed to clone {}: {}", path, e)))?;

        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (binary_tx, binary_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let reader = spawn_reader(
            reader_port,
            Router {
                responses: responses_tx,
                binary: binary_tx,
                events: events.clone(),
            },
            stop.clone(),
            connected.clone(),
            path.to_string(),
        )?;

        let link = SerialLink {
            writer: Mutex::new(port),
            responses: tokio::sync::Mutex::new(responses_rx),
            binary: tokio::sync::Mutex::new(binary_rx),
            events,
            stop,
            connected,
            reader: Mutex::new(Some(reader)),
        };

        let mut hello = vec![CMD_APP_START, APP_PROTOCOL_VERSION];
        hello.extend_from_slice(&[b' '; 6]);
        hello.extend_from_slice(APP_NAME);
        let self_info = match link.command(&hello, timeout).await.and_then(|f| parse_self_info(&f)) {
            Ok(info) => info,
            Err(e) => {
                link.shutdown().await;
                return Err(e);
            }
        };
        info!(
            "Connected to {} ({}) on {}",
            self_info.name,
            crate::logutil::short_key(&self_info.public_key),
            path
        );

        Ok(Arc::new(SerialSession {
            path: path.to_string(),
            self_info,
            link,
        }))
    }

    fn candidate_paths(&self) -> Vec<String> {
        discovery::detect_serial_devices()
    }
}

struct SerialLink {
    writer: Mutex<Box<dyn SerialPort>>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    binary: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u32, Vec<u8>)>>,
    events: broadcast::Sender<RadioEvent>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialLink {
    fn write(&self, payload: &[u8]) -> Result<(), RadioError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RadioError::Disconnected);
        }
        let bytes = encode_frame(payload);
        let mut port = self.writer.lock().unwrap();
        port.write_all(&bytes)?;
        port.flush()?;
        Ok(())
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RadioError> {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(RadioError::Disconnected),
            Err(_) => Err(RadioError::Timeout),
        }
    }

    /// Send one command and return its single response frame.
    async fn command(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, RadioError> {
        let mut rx = self.responses.lock().await;
        while rx.try_recv().is_ok() {}
        self.write(payload)?;
        Self::recv(&mut rx, timeout).await
    }

    async fn command_ok(&self, payload: &[u8]) -> Result<(), RadioError> {
        let frame = self.command(payload, COMMAND_TIMEOUT).await?;
        check_code(&frame, RESP_OK)
    }

    async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

pub struct SerialSession {
    path: String,
    self_info: SelfInfo,
    link: SerialLink,
}

#[async_trait]
impl RadioSession for SerialSession {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn self_info(&self) -> &SelfInfo {
        &self.self_info
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.link.events.subscribe()
    }

    async fn send_direct_message(
        &self,
        contact: &RadioContact,
        text: &str,
        timestamp: u32,
    ) -> Result<SentReceipt, RadioError> {
        let prefix = hex::decode(contact.key_prefix())
            .map_err(|e| RadioError::UnexpectedResponse(format!("bad public key: {}", e)))?;
        let mut payload = vec![CMD_SEND_TXT_MSG, 0, 0];
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(&prefix);
        payload.extend_from_slice(text.as_bytes());

        let frame = self.link.command(&payload, COMMAND_TIMEOUT).await?;
        check_code(&frame, RESP_SENT)?;
        let mut r = FieldReader::new(&frame[1..]);
        let flood = r.u8()? != 0;
        let expected_ack = hex::encode(r.take(4)?);
        let suggested_timeout = Duration::from_millis(u64::from(r.u32()?));
        Ok(SentReceipt {
            expected_ack,
            suggested_timeout,
            flood,
        })
    }

    async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
        timestamp: u32,
    ) -> Result<(), RadioError> {
        let mut payload = vec![CMD_SEND_CHANNEL_TXT_MSG, 0, slot];
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(text.as_bytes());
        self.link.command_ok(&payload).await
    }

    async fn fetch_next_message(&self, timeout: Duration) -> Result<FetchOutcome, RadioError> {
        let frame = self.link.command(&[CMD_SYNC_NEXT_MESSAGE], timeout).await?;
        match frame.first().copied() {
            Some(RESP_NO_MORE_MESSAGES) => Ok(FetchOutcome::NoMore),
            Some(RESP_CONTACT_MSG_RECV) | Some(RESP_CONTACT_MSG_RECV_V3) => {
                Ok(FetchOutcome::Direct(parse_contact_message(&frame)?))
            }
            Some(RESP_CHANNEL_MSG_RECV) | Some(RESP_CHANNEL_MSG_RECV_V3) => {
                Ok(FetchOutcome::Channel(parse_channel_message(&frame)?))
            }
            Some(RESP_ERR) => Err(RadioError::CommandFailed {
                code: frame.get(1).copied().unwrap_or(0),
            }),
            other => Err(RadioError::UnexpectedResponse(format!(
                "unexpected message sync response {:?}",
                other
            ))),
        }
    }

    async fn repeater_request(
        &self,
        contact: &RadioContact,
        query: RepeaterQuery,
        timeout: Duration,
        min_timeout: Duration,
    ) -> Result<Vec<u8>, RadioError> {
        let key = hex::decode(&contact.public_key)
            .map_err(|e| RadioError::UnexpectedResponse(format!("bad public key: {}", e)))?;
        let mut payload = vec![CMD_SEND_BINARY_REQ];
        payload.extend_from_slice(&key);
        payload.push(query.request_code());

        let mut binary = self.link.binary.lock().await;
        while binary.try_recv().is_ok() {}

        let frame = self.link.command(&payload, COMMAND_TIMEOUT).await?;
        check_code(&frame, RESP_SENT)?;
        let mut r = FieldReader::new(&frame[1..]);
        let _flood = r.u8()?;
        let tag = r.u32()?;
        let suggested = Duration::from_millis(u64::from(r.u32()?));
        let wait = timeout.max(min_timeout).max(suggested);

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, binary.recv()).await {
                Ok(Some((got, data))) if got == tag => return Ok(data),
                Ok(Some((got, _))) => debug!("Discarding binary response for tag {:08x}", got),
                Ok(None) => return Err(RadioError::Disconnected),
                Err(_) => return Err(RadioError::Timeout),
            }
        }
    }

    async fn add_contact(&self, contact: &RadioContact) -> Result<(), RadioError> {
        self.link.command_ok(&encode_contact(contact)?).await
    }

    async fn remove_contact(&self, public_key: &str) -> Result<(), RadioError> {
        let key = hex::decode(public_key)
            .map_err(|e| RadioError::UnexpectedResponse(format!("bad public key: {}", e)))?;
        let mut payload = vec![CMD_REMOVE_CONTACT];
        payload.extend_from_slice(&key);
        self.link.command_ok(&payload).await
    }

    async fn get_contacts(&self) -> Result<Vec<RadioContact>, RadioError> {
        let mut rx = self.link.responses.lock().await;
        while rx.try_recv().is_ok() {}
        self.link.write(&[CMD_GET_CONTACTS])?;

        let first = SerialLink::recv(&mut rx, COMMAND_TIMEOUT).await?;
        check_code(&first, RESP_CONTACTS_START)?;
        let mut contacts = Vec::new();
        loop {
            let frame = SerialLink::recv(&mut rx, COMMAND_TIMEOUT).await?;
            match frame.first().copied() {
                Some(RESP_CONTACT) => contacts.push(parse_contact_record(&frame[1..])?),
                Some(RESP_END_OF_CONTACTS) => break,
                other => {
                    return Err(RadioError::UnexpectedResponse(format!(
                        "unexpected frame {:?} in contact list",
                        other
                    )))
                }
            }
        }
        Ok(contacts)
    }

    async fn get_channel(&self, index: u8) -> Result<Option<ChannelSlot>, RadioError> {
        let frame = self
            .link
            .command(&[CMD_GET_CHANNEL, index], COMMAND_TIMEOUT)
            .await?;
        if frame.first() == Some(&RESP_ERR) {
            return Ok(None);
        }
        check_code(&frame, RESP_CHANNEL_INFO)?;
        let mut r = FieldReader::new(&frame[1..]);
        let index = r.u8()?;
        let name = padded_str(r.take(NAME_LEN)?);
        let mut secret = [0u8; 16];
        secret.copy_from_slice(r.take(16)?);
        Ok(Some(ChannelSlot {
            index,
            name,
            secret,
        }))
    }

    async fn set_channel(&self, slot: &ChannelSlot) -> Result<(), RadioError> {
        let mut payload = vec![CMD_SET_CHANNEL, slot.index];
        put_padded(&mut payload, &slot.name, NAME_LEN);
        payload.extend_from_slice(&slot.secret);
        self.link.command_ok(&payload).await
    }

    async fn send_advert(&self, flood: bool) -> Result<(), RadioError> {
        self.link
            .command_ok(&[CMD_SEND_SELF_ADVERT, u8::from(flood)])
            .await
    }

    async fn import_private_key(&self, key: &[u8]) -> Result<(), RadioError> {
        let mut payload = vec![CMD_IMPORT_PRIVATE_KEY];
        payload.extend_from_slice(key);
        self.link.command_ok(&payload).await
    }

    async fn reboot(&self) -> Result<(), RadioError> {
        let mut payload = vec![CMD_REBOOT];
        payload.extend_from_slice(b"reboot");
        // the radio resets without answering
        self.link.write(&payload)
    }

    async fn disconnect(&self) {
        debug!("Disconnecting from radio on {}", self.path);
        self.link.shutdown().await;
    }
}
