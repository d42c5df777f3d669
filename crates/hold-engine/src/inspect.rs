//! Per-request classification supplied by the inspection collaborator.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;
use crate::types::{ChannelName, MessageId, SessionId, SharingKey, UserData};

/// An inbound client request. The engine never looks inside it; it is only
/// handed to the [`Inspector`] and the [`crate::BackendFetcher`].
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            uri: uri.into(),
            ..Self::default()
        }
    }
}

/// How one request should be treated.
///
/// When `do_proxy` is false every other field is ignored.
#[derive(Debug, Clone, Default)]
pub struct InspectionResult {
    pub do_proxy: bool,
    pub sharing_key: SharingKey,
    pub session_id: SessionId,
    pub last_ids: HashMap<ChannelName, MessageId>,
    pub user_data: UserData,
}

impl InspectionResult {
    /// Proxy the request with no sharing and no session.
    pub fn proxy() -> Self {
        Self {
            do_proxy: true,
            ..Self::default()
        }
    }

    pub fn reject() -> Self {
        Self::default()
    }

    pub fn with_sharing_key(mut self, key: impl Into<SharingKey>) -> Self {
        self.sharing_key = key.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_last_id(
        mut self,
        channel: impl Into<ChannelName>,
        id: impl Into<MessageId>,
    ) -> Self {
        self.last_ids.insert(channel.into(), id.into());
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<UserData>) -> Self {
        self.user_data = user_data.into();
        self
    }

    pub fn is_shareable(&self) -> bool {
        !self.sharing_key.is_empty()
    }
}

#[async_trait]
pub trait Inspector: Send + Sync {
    /// Classify `request`. Failures must be reported as
    /// [`EngineError::InspectionUnavailable`]; the engine then refuses to proxy.
    async fn inspect(&self, request: &ProxyRequest) -> Result<InspectionResult, EngineError>;
}

#[async_trait]
impl<F> Inspector for F
where
    F: Fn(&ProxyRequest) -> Result<InspectionResult, EngineError> + Send + Sync,
{
    async fn inspect(&self, request: &ProxyRequest) -> Result<InspectionResult, EngineError> {
        (self)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_cursors_and_keys() {
        let result = InspectionResult::proxy()
            .with_sharing_key("k1")
            .with_session("s1")
            .with_last_id("c1", "5")
            .with_last_id("c2", "9")
            .with_last_id("c1", "6");

        assert!(result.do_proxy);
        assert!(result.is_shareable());
        assert_eq!(result.last_ids.len(), 2);
        assert_eq!(
            result.last_ids.get(&ChannelName::from("c1")),
            Some(&MessageId::from("6"))
        );
    }

    #[test]
    fn rejection_is_the_default() {
        let result = InspectionResult::default();
        assert!(!result.do_proxy);
        assert!(!result.is_shareable());
    }

    #[tokio::test]
    async fn closures_act_as_inspectors() {
        let inspector = |request: &ProxyRequest| {
            if request.uri.starts_with("/stream") {
                Ok(InspectionResult::proxy())
            } else {
                Err(EngineError::InspectionUnavailable("no route".into()))
            }
        };

        let ok = inspector.inspect(&ProxyRequest::get("/stream/a")).await;
        assert!(ok.expect("inspected").do_proxy);
        let err = inspector.inspect(&ProxyRequest::get("/other")).await;
        assert!(matches!(err, Err(EngineError::InspectionUnavailable(_))));
    }
}
