use std::sync::{Arc, Mutex};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vbstore_storage::MemoryKvStore;
use vbstore_types::config::EngineConfig;

use crate::vbucket::{ClientCookie, ClientNotifier, EngineStatus};
use crate::EpStore;

pub(crate) fn init_test_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("debug"))
                .unwrap(),
        )
        .try_init();
}

/// Records the clients it is asked to wake.
#[derive(Debug, Default)]
pub(crate) struct TestClientNotifier(Mutex<Vec<(ClientCookie, EngineStatus)>>);

impl TestClientNotifier {
    pub(crate) fn take(&self) -> Vec<(ClientCookie, EngineStatus)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl ClientNotifier for TestClientNotifier {
    fn notify_io_complete(&self, cookie: ClientCookie, status: EngineStatus) {
        self.0.lock().unwrap().push((cookie, status));
    }
}

/// An engine over a fresh in-memory store.
pub(crate) fn test_store(config: EngineConfig) -> (EpStore, Arc<MemoryKvStore>) {
    init_test_logger();
    let kvstore = Arc::new(MemoryKvStore::new(&config.store));
    let store = EpStore::new(
        config,
        kvstore.clone(),
        Arc::new(TestClientNotifier::default()),
    )
    .unwrap();
    (store, kvstore)
}
