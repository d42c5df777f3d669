//! Hold/publish engine for a realtime reverse proxy.
//!
//! Each inbound request is classified by an [`InspectionResult`]. Requests
//! that may be proxied go through the [`RequestSharingRegistry`], which
//! coalesces concurrent requests with the same sharing key into a single
//! backend fetch. When the backend answers with a [`HoldInstruction`] the
//! connection is registered in the [`HoldRegistry`] against its channels, and
//! the [`PublishDispatcher`] later pushes published events to it, using
//! per-session cursors in the [`ChannelCursorStore`] to skip duplicates and
//! to force a reconnect when it detects a gap.
//!
//! Network listeners, the outbound HTTP client and the publish transport stay
//! outside the crate; they plug in through [`Inspector`], [`BackendFetcher`],
//! [`Transport`] and [`PublishSource`].

pub mod backend;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod display;
pub mod engine;
pub mod error;
pub mod hold;
pub mod inspect;
pub mod sharing;
pub mod source;
pub mod types;

#[doc(hidden)]
pub mod testing;

pub use backend::{BackendFetcher, BackendResponse, FetchReply, HoldChannel, HoldInstruction, Transport};
pub use config::EngineConfig;
pub use cursor::{ArrivalOrder, ChannelCursorStore, FnOrdering, IdOrdering};
pub use dispatch::{DeliveryReport, EventKind, PublishDispatcher, PublishEvent};
pub use engine::{Engine, EngineBuilder, EngineStats, HandleOutcome, SweepReport};
pub use error::{CloseReason, EngineError, FetchError, SourceError, TransportError};
pub use hold::{ClosePolicy, HeldConnection, HoldRegistry};
pub use inspect::{InspectionResult, Inspector, ProxyRequest};
pub use sharing::{Acquired, RequestSharingRegistry};
pub use source::{LocalPublishBus, LocalPublishSource, PublishSink, PublishSource};
pub use types::{ChannelName, HoldHandle, MessageId, Payload, SessionId, SharingKey, UserData};
