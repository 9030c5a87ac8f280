//! Message Store
//!
//! Reference-counted registry of published messages. One stored message can
//! be referenced by many pending deliveries; each delivery holds a
//! [`MessageHandle`] and the store alone decides when the record dies.

use std::fmt;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::trace;

use crate::protocol::QoS;

/// Immutable application message as received in a PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub content: Bytes,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    /// Publisher's packet id, meaningful only for QoS 1/2
    pub packet_id: Option<u16>,
}

/// Stable handle to a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(u64);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

#[derive(Debug)]
struct MessageRecord {
    message: TopicMessage,
    refs: usize,
}

/// Store errors. Both indicate a broken ownership invariant in the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Handle was never issued or the record is already destroyed
    UnknownHandle(MessageHandle),
    /// Release on a record nobody holds
    ZeroReferenceCount(MessageHandle),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle(h) => write!(f, "unknown message handle {}", h),
            Self::ZeroReferenceCount(h) => write!(f, "release of unreferenced message {}", h),
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other deliveries still reference the message
    Retained(usize),
    /// Last reference dropped, record destroyed
    Destroyed,
}

/// Arena of messages indexed by handle
#[derive(Debug, Default)]
pub struct MessageStore {
    records: AHashMap<u64, MessageRecord>,
    next_id: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message with a reference count of 0
    pub fn insert(&mut self, message: TopicMessage) -> MessageHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, MessageRecord { message, refs: 0 });
        MessageHandle(id)
    }

    /// Take one more reference for a new delivery
    pub fn retain(&mut self, handle: MessageHandle) -> Result<usize, StoreError> {
        let record = self
            .records
            .get_mut(&handle.0)
            .ok_or(StoreError::UnknownHandle(handle))?;
        record.refs += 1;
        Ok(record.refs)
    }

    /// Drop one reference; the record is destroyed on the 1 -> 0 transition
    pub fn release(&mut self, handle: MessageHandle) -> Result<Release, StoreError> {
        let record = self
            .records
            .get_mut(&handle.0)
            .ok_or(StoreError::UnknownHandle(handle))?;

        if record.refs == 0 {
            return Err(StoreError::ZeroReferenceCount(handle));
        }

        record.refs -= 1;
        if record.refs > 0 {
            return Ok(Release::Retained(record.refs));
        }

        self.records.remove(&handle.0);
        trace!("{} destroyed", handle);
        Ok(Release::Destroyed)
    }

    /// Drop a freshly inserted message that fan-out did not hand to anyone.
    /// Returns true if the record was removed.
    pub fn discard_if_unreferenced(&mut self, handle: MessageHandle) -> bool {
        match self.records.get(&handle.0) {
            Some(record) if record.refs == 0 => {
                self.records.remove(&handle.0);
                trace!("{} discarded without deliveries", handle);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&TopicMessage> {
        self.records.get(&handle.0).map(|r| &r.message)
    }

    pub fn ref_count(&self, handle: MessageHandle) -> Option<usize> {
        self.records.get(&handle.0).map(|r| r.refs)
    }

    pub fn contains(&self, handle: MessageHandle) -> bool {
        self.records.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
