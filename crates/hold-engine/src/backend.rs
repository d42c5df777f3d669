//! Collaborator contracts for the origin fetch and the client transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CloseReason, FetchError, TransportError};
use crate::hold::ClosePolicy;
use crate::inspect::ProxyRequest;
use crate::types::{ChannelName, HoldHandle, MessageId, Payload, UserData};

/// An ordinary origin response, forwarded to the client unmodified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// One channel named by a hold instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldChannel {
    pub name: ChannelName,
    /// Id the backend says the client has already seen on this channel.
    pub prev_id: Option<MessageId>,
}

impl HoldChannel {
    pub fn new(name: impl Into<ChannelName>) -> Self {
        Self {
            name: name.into(),
            prev_id: None,
        }
    }

    pub fn with_prev_id(mut self, prev_id: impl Into<MessageId>) -> Self {
        self.prev_id = Some(prev_id.into());
        self
    }
}

/// Backend instruction to keep the client connection open and subscribe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInstruction {
    pub channels: Vec<HoldChannel>,
    pub close_policy: ClosePolicy,
    /// Per-hold timeout, capped by the engine's configured maximum.
    pub timeout: Option<Duration>,
    /// Response the transport writes before the connection starts waiting.
    pub initial_response: Option<BackendResponse>,
}

impl HoldInstruction {
    pub fn new(channels: impl IntoIterator<Item = HoldChannel>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            close_policy: ClosePolicy::KeepOpen,
            timeout: None,
            initial_response: None,
        }
    }

    pub fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_initial_response(mut self, response: BackendResponse) -> Self {
        self.initial_response = Some(response);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReply {
    Response(BackendResponse),
    Hold(HoldInstruction),
}

#[async_trait]
pub trait BackendFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &ProxyRequest,
        user_data: &UserData,
    ) -> Result<FetchReply, FetchError>;
}

/// Writes to and closes held client connections.
///
/// Disconnects flow the other way: the transport reports them through
/// [`crate::Engine::on_disconnect`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write_message(&self, handle: HoldHandle, payload: Payload) -> Result<(), TransportError>;

    async fn close_connection(&self, handle: HoldHandle, reason: CloseReason);
}
