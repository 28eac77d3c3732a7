// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cross-context messages and broadcast transports
//!
//! Transports move opaque frames. Every frame is a bincode-encoded
//! [`ChannelMessage`]; delivery is fire-and-forget, at most once, with no
//! ordering guarantee across senders.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CacheResult;
use crate::store::{CacheKey, Priority, WriteStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOp {
    Set,
    Delete,
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationOp::Set => f.write_str("set"),
            MutationOp::Delete => f.write_str("delete"),
        }
    }
}

/// Value carried by a remote `set`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Raw (uncompressed) value bytes
    pub value: Vec<u8>,
    /// Absolute expiry in epoch millis; relaying never extends it
    pub expires_at: u64,
    pub priority: Priority,
    pub dependencies: Vec<CacheKey>,
    pub prefetched: bool,
}

/// One local mutation, as seen by other contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyEvent {
    pub key: CacheKey,
    pub op: MutationOp,
    /// Hybrid logical timestamp of the write
    pub timestamp: u64,
    /// Context that performed the write
    pub origin_id: Uuid,
    /// Missing on a `set` means "a newer value exists elsewhere"
    pub payload: Option<EventPayload>,
}

impl ConsistencyEvent {
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp::new(self.timestamp, self.origin_id)
    }
}

/// Per-key state summary exchanged during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDigest {
    pub key: CacheKey,
    pub stamp: WriteStamp,
    /// crc32 of the raw value; `None` for a tombstone
    pub checksum: Option<u32>,
}

impl KeyDigest {
    pub fn is_present(&self) -> bool {
        self.checksum.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    Mutation {
        sender: Uuid,
        event: ConsistencyEvent,
    },
    DigestRequest {
        sender: Uuid,
        request_id: u64,
        digests: Vec<KeyDigest>,
    },
    DigestResponse {
        sender: Uuid,
        request_id: u64,
        to: Uuid,
        digests: Vec<KeyDigest>,
    },
}

impl ChannelMessage {
    pub fn sender(&self) -> Uuid {
        match self {
            ChannelMessage::Mutation { sender, .. }
            | ChannelMessage::DigestRequest { sender, .. }
            | ChannelMessage::DigestResponse { sender, .. } => *sender,
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(frame: &[u8]) -> CacheResult<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}

/// Receiving half of a subscription
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Next frame; `None` once the channel is closed
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Pub/sub transport between execution contexts.
///
/// A context may receive its own frames back; receivers filter by sender.
pub trait ConsistencyChannel: Send + Sync {
    fn send(&self, frame: Vec<u8>) -> CacheResult<()>;

    fn subscribe(&self) -> Box<dyn ChannelReceiver>;

    fn name(&self) -> &str {
        "channel"
    }
}

/// In-process broadcast bus connecting any number of contexts
#[derive(Debug, Clone)]
pub struct InMemoryHub {
    sender: broadcast::Sender<Vec<u8>>,
}

impl InMemoryHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A channel endpoint for one context
    pub fn channel(&self) -> Arc<InMemoryChannel> {
        Arc::new(InMemoryChannel {
            sender: self.sender.clone(),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryChannel {
    sender: broadcast::Sender<Vec<u8>>,
}

impl ConsistencyChannel for InMemoryChannel {
    fn send(&self, frame: Vec<u8>) -> CacheResult<()> {
        // No subscribers is not an error for fire-and-forget delivery
        if self.sender.send(frame).is_err() {
            log::debug!("No subscribers on in-memory channel; frame dropped");
        }
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn ChannelReceiver> {
        Box::new(BroadcastReceiver {
            receiver: self.sender.subscribe(),
        })
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

struct BroadcastReceiver {
    receiver: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl ChannelReceiver for BroadcastReceiver {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Consistency receiver lagged; {} frames lost until next reconciliation",
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
