//! Index dispatch queue
//!
//! Hashes pushed by protocol handlers wait in an unbounded channel. One
//! task drains it while the node is not suspended, runs the [`Indexer`] on
//! a blocking thread and stores each finished hash through the
//! [`MarkerStore`].

use crate::network::controls::Controls;
use crate::storage::{MarkerStore, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transaction hash as received from the network
pub type TxHash = [u8; 32];

/// Indexing errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Indexing failed: {0}")]
    Failed(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Dispatch queue is closed")]
    Closed,
}

/// Consumer of dispatched hashes
pub trait Indexer: Send + Sync + 'static {
    /// Called once before the first hash with the last stored marker
    fn resume(&self, last: Option<&[u8]>) -> Result<(), IndexError>;

    /// Index one transaction
    fn index(&self, hash: &TxHash) -> Result<(), IndexError>;
}

/// Indexer that only logs what it is handed
#[derive(Debug, Default)]
pub struct LogIndexer;

impl Indexer for LogIndexer {
    fn resume(&self, last: Option<&[u8]>) -> Result<(), IndexError> {
        match last {
            Some(marker) => log::info!("Indexing resumes after {}", hex::encode(marker)),
            None => log::info!("Indexing starts from scratch"),
        }
        Ok(())
    }

    fn index(&self, hash: &TxHash) -> Result<(), IndexError> {
        log::debug!("Indexed {}", hex::encode(hash));
        Ok(())
    }
}

/// Queue between the network and the indexer
pub struct IndexDispatch {
    tx: mpsc::UnboundedSender<TxHash>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexDispatch {
    /// Resume the indexer from the stored marker and start consuming
    pub fn start(
        indexer: Arc<dyn Indexer>,
        markers: Arc<dyn MarkerStore>,
        controls: Controls,
    ) -> Result<Self, IndexError> {
        let last = markers.read_last()?;
        indexer.resume(last.as_deref())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run(
            rx,
            indexer,
            markers,
            controls,
            Arc::clone(&pending),
            Arc::clone(&processed),
        ));

        Ok(Self {
            tx,
            pending,
            processed,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a hash for indexing
    pub fn push(&self, hash: TxHash) -> Result<(), IndexError> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(hash).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    /// Hashes queued but not yet indexed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Hashes indexed since start
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Wait for the consumer task to exit after shutdown
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Index dispatch ended abnormally: {}", e);
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<TxHash>,
    indexer: Arc<dyn Indexer>,
    markers: Arc<dyn MarkerStore>,
    controls: Controls,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
) {
    let shutdown = controls.child_token();
    let mut held: Option<TxHash> = None;

    loop {
        if !controls.wait_resumed().await {
            break;
        }

        let hash = match held.take() {
            Some(hash) => hash,
            None => tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = controls.changed() => continue,
                item = rx.recv() => match item {
                    Some(hash) => hash,
                    None => break,
                },
            },
        };

        // Suspended while waiting: keep it for after the resume
        if controls.is_suspended() {
            held = Some(hash);
            continue;
        }

        let indexer = Arc::clone(&indexer);
        let markers = Arc::clone(&markers);
        let result = tokio::task::spawn_blocking(move || -> Result<(), IndexError> {
            indexer.index(&hash)?;
            markers.write_last(&hash)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                processed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Err(e)) => log::warn!("Could not index {}: {}", hex::encode(hash), e),
            Err(e) => log::warn!("Indexer task failed on {}: {}", hex::encode(hash), e),
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }

    rx.close();
    log::debug!("Index dispatch stopped with {} pending", pending.load(Ordering::Acquire));
}
