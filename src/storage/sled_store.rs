use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional};

use super::{
    now_secs, ChannelRecord, Contact, ContactUpdate, GatewayStore, Inserted, MessageKind,
    MessageRecord, NewMessage, RawPacketRecord, StoreCounts,
};
use crate::errors::GatewayError;

const TREE_MESSAGES: &str = "messages";
const TREE_MESSAGE_INDEX: &str = "message_index";
const TREE_RAW: &str = "raw_packets";
const TREE_RAW_INDEX: &str = "raw_index";
const TREE_CONTACTS: &str = "contacts";
const TREE_CHANNELS: &str = "channels";

/// Helper builder so tests can create throwaway stores.
pub struct SledStoreBuilder {
    path: PathBuf,
    temporary: bool,
}

impl SledStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temporary: false,
        }
    }

    /// Remove the database files when the store is dropped.
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn open(self) -> Result<SledStore, GatewayError> {
        std::fs::create_dir_all(&self.path)?;
        let db = sled::Config::new()
            .path(&self.path)
            .temporary(self.temporary)
            .open()?;
        SledStore::from_db(db)
    }
}

/// Sled-backed [`GatewayStore`]. Records are bincode encoded; ids are big-endian
/// so tree iteration follows insertion order.
pub struct SledStore {
    db: sled::Db,
    messages: sled::Tree,
    message_index: sled::Tree,
    raw: sled::Tree,
    raw_index: sled::Tree,
    contacts: sled::Tree,
    channels: sled::Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        SledStoreBuilder::new(path.as_ref()).open()
    }

    fn from_db(db: sled::Db) -> Result<Self, GatewayError> {
        Ok(Self {
            messages: db.open_tree(TREE_MESSAGES)?,
            message_index: db.open_tree(TREE_MESSAGE_INDEX)?,
            raw: db.open_tree(TREE_RAW)?,
            raw_index: db.open_tree(TREE_RAW_INDEX)?,
            contacts: db.open_tree(TREE_CONTACTS)?,
            channels: db.open_tree(TREE_CHANNELS)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), GatewayError> {
        self.db.flush()?;
        Ok(())
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, GatewayError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
        Ok(bincode::deserialize::<T>(bytes)?)
    }

    fn next_id(&self) -> Result<u64, GatewayError> {
        // sled ids start at 0; keep 0 free so ids read naturally in logs
        Ok(self.db.generate_id()? + 1)
    }

    fn id_from_ivec(bytes: &IVec) -> u64 {
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[8 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
        u64::from_be_bytes(buf)
    }

    fn message_dedup_key(
        kind: MessageKind,
        conversation_key: &str,
        text: &str,
        sender_timestamp: Option<i64>,
    ) -> Result<Vec<u8>, GatewayError> {
        let canonical = Self::serialize(&(kind, conversation_key, text, sender_timestamp))?;
        Ok(Sha256::digest(canonical).to_vec())
    }

    fn contact_key(public_key: &str) -> Vec<u8> {
        public_key.to_ascii_lowercase().into_bytes()
    }

    fn channel_key(key_hex: &str) -> Vec<u8> {
        key_hex.to_ascii_uppercase().into_bytes()
    }

    fn load_all<T: serde::de::DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, GatewayError> {
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Read-modify-write of one record inside a transaction; missing records abort with NotFound.
    fn modify<T, F>(tree: &sled::Tree, key: &[u8], what: &str, f: F) -> Result<T, GatewayError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone,
        F: Fn(&mut T),
    {
        let result = tree.transaction(|tx| {
            let Some(bytes) = tx.get(key)? else {
                return Err(ConflictableTransactionError::Abort(GatewayError::NotFound(
                    what.to_string(),
                )));
            };
            let mut record: T =
                Self::deserialize(&bytes).map_err(ConflictableTransactionError::Abort)?;
            f(&mut record);
            let encoded = Self::serialize(&record).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key, encoded)?;
            Ok(record)
        });
        let record = result.map_err(flatten_tx_error)?;
        tree.flush()?;
        Ok(record)
    }
}

fn flatten_tx_error(err: TransactionError<GatewayError>) -> GatewayError {
    match err {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => GatewayError::Sled(inner),
    }
}

impl GatewayStore for SledStore {
    fn create_message(&self, msg: &NewMessage) -> Result<Inserted, GatewayError> {
        let dedup = Self::message_dedup_key(
            msg.kind,
            &msg.conversation_key,
            &msg.text,
            msg.sender_timestamp,
        )?;
        let id = self.next_id()?;
        let id_key = id.to_be_bytes();
        let encoded = Self::serialize(&MessageRecord::from_new(id, msg))?;

        let result = (&self.messages, &self.message_index).transaction(|(messages, index)| {
            if let Some(existing) = index.get(&dedup)? {
                return Ok(Inserted::Duplicate(Self::id_from_ivec(&existing)));
            }
            index.insert(dedup.as_slice(), &id_key[..])?;
            messages.insert(&id_key[..], encoded.as_slice())?;
            Ok(Inserted::New(id))
        });
        let inserted = result.map_err(flatten_tx_error)?;
        if inserted.is_new() {
            self.messages.flush()?;
        } else {
            debug!("message insert deduplicated to id {}", inserted.id());
        }
        Ok(inserted)
    }

    fn get_message(&self, id: u64) -> Result<Option<MessageRecord>, GatewayError> {
        match self.messages.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn increment_ack_count(&self, id: u64) -> Result<u32, GatewayError> {
        let record: MessageRecord = Self::modify(
            &self.messages,
            &id.to_be_bytes(),
            &format!("message {}", id),
            |rec: &mut MessageRecord| rec.ack_count += 1,
        )?;
        Ok(record.ack_count)
    }

    fn insert_raw_packet(&self, data: &[u8], timestamp: i64) -> Result<Inserted, GatewayError> {
        let digest = Sha256::digest(data).to_vec();
        let id = self.next_id()?;
        let id_key = id.to_be_bytes();
        let encoded = Self::serialize(&RawPacketRecord {
            id,
            timestamp,
            data: data.to_vec(),
            decrypted: false,
            message_id: None,
            decrypt_attempts: 0,
            last_attempt: None,
        })?;

        let result = (&self.raw, &self.raw_index).transaction(|(raw, index)| {
            if let Some(existing) = index.get(&digest)? {
                return Ok(Inserted::Duplicate(Self::id_from_ivec(&existing)));
            }
            index.insert(digest.as_slice(), &id_key[..])?;
            raw.insert(&id_key[..], encoded.as_slice())?;
            Ok(Inserted::New(id))
        });
        let inserted = result.map_err(flatten_tx_error)?;
        if inserted.is_new() {
            self.raw.flush()?;
        }
        Ok(inserted)
    }

    fn get_raw_packet(&self, id: u64) -> Result<Option<RawPacketRecord>, GatewayError> {
        match self.raw.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn mark_raw_decrypted(&self, packet_id: u64, message_id: u64) -> Result<(), GatewayError> {
        Self::modify(
            &self.raw,
            &packet_id.to_be_bytes(),
            &format!("raw packet {}", packet_id),
            |rec: &mut RawPacketRecord| {
                rec.decrypted = true;
                rec.message_id = Some(message_id);
            },
        )?;
        Ok(())
    }

    fn increment_raw_attempts(&self, packet_id: u64) -> Result<(), GatewayError> {
        let now = now_secs();
        Self::modify(
            &self.raw,
            &packet_id.to_be_bytes(),
            &format!("raw packet {}", packet_id),
            |rec: &mut RawPacketRecord| {
                rec.decrypt_attempts += 1;
                rec.last_attempt = Some(now);
            },
        )?;
        Ok(())
    }

    fn undecrypted_count(&self) -> Result<usize, GatewayError> {
        let mut count = 0;
        for entry in self.raw.iter() {
            let (_, value) = entry?;
            let rec: RawPacketRecord = Self::deserialize(&value)?;
            if !rec.decrypted {
                count += 1;
            }
        }
        Ok(count)
    }

    fn undecrypted_packets(&self) -> Result<Vec<RawPacketRecord>, GatewayError> {
        let mut packets: Vec<RawPacketRecord> = Self::load_all::<RawPacketRecord>(&self.raw)?
            .into_iter()
            .filter(|p| !p.decrypted)
            .collect();
        packets.sort_by_key(|p| (p.timestamp, p.id));
        Ok(packets)
    }

    fn upsert_channel(&self, channel: &ChannelRecord) -> Result<(), GatewayError> {
        let mut record = channel.clone();
        record.key = record.key.to_ascii_uppercase();
        self.channels
            .insert(Self::channel_key(&record.key), Self::serialize(&record)?)?;
        self.channels.flush()?;
        Ok(())
    }

    fn channels(&self) -> Result<Vec<ChannelRecord>, GatewayError> {
        Self::load_all(&self.channels)
    }

    fn channel_by_key(&self, key_hex: &str) -> Result<Option<ChannelRecord>, GatewayError> {
        match self.channels.get(Self::channel_key(key_hex))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn channel_by_name(&self, name: &str) -> Result<Option<ChannelRecord>, GatewayError> {
        Ok(self
            .channels()?
            .into_iter()
            .find(|channel| channel.name == name))
    }

    fn upsert_contact(&self, update: &ContactUpdate) -> Result<Contact, GatewayError> {
        let key = Self::contact_key(&update.public_key);
        let result = self.contacts.transaction(|tx| {
            let mut contact = match tx.get(&key)? {
                Some(bytes) => {
                    Self::deserialize::<Contact>(&bytes).map_err(ConflictableTransactionError::Abort)?
                }
                None => Contact::new(&update.public_key),
            };
            contact.merge(update);
            let encoded = Self::serialize(&contact).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key.as_slice(), encoded)?;
            Ok(contact)
        });
        let contact = result.map_err(flatten_tx_error)?;
        self.contacts.flush()?;
        Ok(contact)
    }

    fn contact_by_key(&self, public_key: &str) -> Result<Option<Contact>, GatewayError> {
        match self.contacts.get(Self::contact_key(public_key))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contact_by_prefix(&self, prefix: &str) -> Result<Option<Contact>, GatewayError> {
        if prefix.is_empty() {
            return Ok(None);
        }
        match self.contacts.scan_prefix(Self::contact_key(prefix)).next() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(Self::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    fn update_contact_path(
        &self,
        public_key: &str,
        path: Option<&str>,
        path_len: i32,
    ) -> Result<(), GatewayError> {
        let path = path.map(str::to_string);
        Self::modify(
            &self.contacts,
            &Self::contact_key(public_key),
            &format!("contact {}", public_key),
            |contact: &mut Contact| {
                if path.is_some() {
                    contact.last_path = path.clone();
                }
                contact.last_path_len = path_len;
            },
        )?;
        Ok(())
    }

    fn update_last_contacted(&self, public_key: &str, at: i64) -> Result<(), GatewayError> {
        Self::modify(
            &self.contacts,
            &Self::contact_key(public_key),
            &format!("contact {}", public_key),
            |contact: &mut Contact| contact.last_contacted = Some(at),
        )?;
        Ok(())
    }

    fn set_contact_on_radio(&self, public_key: &str, on_radio: bool) -> Result<(), GatewayError> {
        Self::modify(
            &self.contacts,
            &Self::contact_key(public_key),
            &format!("contact {}", public_key),
            |contact: &mut Contact| contact.on_radio = on_radio,
        )?;
        Ok(())
    }

    fn recent_non_repeaters(&self, limit: usize) -> Result<Vec<Contact>, GatewayError> {
        let mut contacts: Vec<Contact> = Self::load_all::<Contact>(&self.contacts)?
            .into_iter()
            .filter(|c| !c.is_repeater())
            .collect();
        // None sorts below Some, so reversing puts never-contacted contacts last
        contacts.sort_by(|a, b| {
            (b.last_contacted, b.last_advert).cmp(&(a.last_contacted, a.last_advert))
        });
        contacts.truncate(limit);
        Ok(contacts)
    }

    fn counts(&self) -> Result<StoreCounts, GatewayError> {
        Ok(StoreCounts {
            messages: self.messages.len(),
            raw_packets: self.raw.len(),
            undecrypted: self.undecrypted_count()?,
            contacts: self.contacts.len(),
            channels: self.channels.len(),
        })
    }
}
