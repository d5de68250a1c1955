//! Background organizer thread
//!
//! Writers call [`BorgWorker::notify`] after changing a node's buffers. At
//! most one request is queued; notifications arriving while one is pending
//! are folded into it.

use crate::organizer::BufferOrganizer;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tierio_common::{Error, Result};
use tracing::{debug, error, info};

pub struct BorgWorker {
    sender: Sender<()>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BorgWorker {
    /// Start the organizer thread
    pub fn spawn(organizer: Arc<BufferOrganizer>) -> Result<Self> {
        let (sender, receiver) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("tierio-borg".to_string())
            .spawn(move || run(&organizer, &receiver, &flag))
            .map_err(|e| Error::internal(format!("failed to start organizer thread: {}", e)))?;

        Ok(Self {
            sender,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for an organize pass
    pub fn notify(&self) {
        match self.sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => debug!("Organizer thread has exited"),
        }
    }

    /// Stop the thread after its current pass
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.sender.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(organizer: &BufferOrganizer, receiver: &Receiver<()>, shutdown: &AtomicBool) {
    info!("Buffer organizer thread started");
    while receiver.recv().is_ok() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = organizer.organize_once() {
            error!("Organize pass failed: {}", e);
        }
    }
    info!("Buffer organizer thread stopped");
}

impl Drop for BorgWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_path::DataPath;
    use std::time::{Duration, Instant};
    use tierio_common::config::{Config, DeviceConfig, DeviceKind, SwapConfig};
    use tierio_common::{KIB, MIB, NoTransport, NodeId};
    use tierio_meta::MetadataManager;
    use tierio_placement::DataPlacementEngine;
    use tierio_storage::BufferPool;

    fn organizer() -> Arc<BufferOrganizer> {
        let config = Config {
            devices: vec![DeviceConfig::ram("ram", MIB, 4 * KIB)],
            swap: SwapConfig {
                kind: DeviceKind::Ram,
                mount_point: None,
                capacity: MIB,
            },
            ..Config::default()
        };
        let pool = Arc::new(BufferPool::new(NodeId::new(1), &config.devices, &config.swap).unwrap());
        let mdm = Arc::new(
            MetadataManager::new(
                &config.node,
                &config.metadata,
                Arc::clone(pool.registry()),
                Arc::new(NoTransport),
            )
            .unwrap(),
        );
        let data = Arc::new(DataPath::new(pool, Arc::new(NoTransport)));
        let dpe = Arc::new(DataPlacementEngine::new(&config.dpe));
        Arc::new(BufferOrganizer::new(&config, data, mdm, dpe))
    }

    #[test]
    fn test_notify_runs_a_pass() {
        let organizer = organizer();
        let worker = BorgWorker::spawn(Arc::clone(&organizer)).unwrap();
        worker.notify();

        let deadline = Instant::now() + Duration::from_secs(5);
        while organizer.stats().passes.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(organizer.stats().passes.load(Ordering::Relaxed) >= 1);
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let worker = BorgWorker::spawn(organizer()).unwrap();
        for _ in 0..10 {
            worker.notify();
        }
        worker.shutdown();
        worker.shutdown();
        worker.notify();
    }
}
