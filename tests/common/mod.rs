#![allow(dead_code)]

use archsync_lib::core::{
    EventSink, NullSink, RunSettings, Runner, SinkEvent, StreamCopyBackend, TransferBackend,
    TransferEvent, TransferExecutor,
};
use archsync_lib::db::{memory_pool, SqliteStore};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

pub fn write_file(root: &Path, rel: &str, bytes: usize) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'x'; bytes]).unwrap();
}

pub fn read_len(root: &Path, rel: &str) -> Option<u64> {
    std::fs::metadata(root.join(rel)).ok().map(|m| m.len())
}

/// Keeps every published event
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: &SinkEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Stream copy that fails to read any file whose name is in `failing`
pub struct FailingBackend {
    inner: StreamCopyBackend,
    failing: Vec<String>,
}

impl FailingBackend {
    pub fn new(failing: &[&str]) -> Self {
        Self {
            inner: StreamCopyBackend::default(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl TransferBackend for FailingBackend {
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let name = from.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if self.failing.contains(&name) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated read error"));
        }
        self.inner.copy_file(from, to).await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Stream copy that blocks every copy until `release` is called
pub struct GatedBackend {
    inner: StreamCopyBackend,
    gate: Arc<Semaphore>,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self {
            inner: StreamCopyBackend::default(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn release(&self, copies: usize) {
        self.gate.add_permits(copies);
    }
}

#[async_trait]
impl TransferBackend for GatedBackend {
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        permit.forget();
        self.inner.copy_file(from, to).await
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Run the executor to completion, collecting every event
pub async fn execute_collect(
    backend: Arc<dyn TransferBackend>,
    request: archsync_lib::core::RunRequest,
) -> (archsync_lib::SyncResult<archsync_lib::core::RunSummary>, Vec<TransferEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let result = TransferExecutor::new(backend).execute(request, tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

pub async fn memory_store() -> SqliteStore {
    SqliteStore::new(Arc::new(memory_pool().await.unwrap()))
}

/// A runner over an in-memory store, collecting sink events
pub fn runner_with(
    store: &SqliteStore,
    sink: Arc<dyn EventSink>,
    backend: Arc<dyn TransferBackend>,
    settings: RunSettings,
) -> Runner {
    let store = Arc::new(store.clone());
    Runner::new(store.clone(), store, sink, backend, settings)
}

pub fn null_sink() -> Arc<dyn EventSink> {
    Arc::new(NullSink)
}
