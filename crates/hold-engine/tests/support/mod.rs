#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use hold_engine::{Engine, EngineConfig, FetchError, FetchReply};

pub use hold_engine::testing::{RecordingTransport, ScriptedFetcher, TransportEvent as Event};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub engine: Engine,
    pub fetcher: Arc<ScriptedFetcher>,
    pub transport: Arc<RecordingTransport>,
}

impl Harness {
    pub fn new(reply: Result<FetchReply, FetchError>, config: EngineConfig) -> Self {
        Self::with_delay(reply, config, Duration::from_millis(20))
    }

    pub fn with_delay(
        reply: Result<FetchReply, FetchError>,
        config: EngineConfig,
        delay: Duration,
    ) -> Self {
        init_tracing();
        let fetcher = Arc::new(ScriptedFetcher::new(reply).with_delay(delay));
        let transport = Arc::new(RecordingTransport::default());
        let engine = Engine::new(config, fetcher.clone(), transport.clone());
        Self {
            engine,
            fetcher,
            transport,
        }
    }
}
