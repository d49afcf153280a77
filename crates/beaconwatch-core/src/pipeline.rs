//! Bounded packet worker pool.
//!
//! Radios deliver packets faster than a single thread may parse them, so
//! packets are processed on tokio's blocking pool. A semaphore caps the
//! number in flight; when it is exhausted [`ScanPipeline::try_submit`] drops
//! the packet with a warning rather than queueing without bound.
//!
//! [`ScanPipeline::end_cycle`] waits for every packet submitted so far before
//! finalizing the cycle, so no packet from cycle N is counted in cycle N+1.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::engine::{BeaconEngine, CycleReport};
use crate::error::{BeaconError, Result};
use crate::parser::RawPacket;

/// Drives a [`BeaconEngine`] from async code.
#[derive(Debug)]
pub struct ScanPipeline {
    engine: Arc<BeaconEngine>,
    permits: Arc<Semaphore>,
    workers: usize,
    in_flight: Mutex<JoinSet<()>>,
}

impl ScanPipeline {
    /// Creates a pool with `workers` concurrent packets; 0 uses every CPU.
    #[must_use]
    pub fn new(engine: Arc<BeaconEngine>, workers: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            workers
        };
        debug!(workers, "Starting scan pipeline");
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// The engine being driven.
    #[must_use]
    pub const fn engine(&self) -> &Arc<BeaconEngine> {
        &self.engine
    }

    /// Maximum packets processed concurrently.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Queues a packet, waiting for a free worker.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::PipelineClosed`] after [`shutdown`](Self::shutdown).
    pub async fn submit(&self, packet: RawPacket) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BeaconError::PipelineClosed)?;
        self.spawn(packet, permit).await;
        Ok(())
    }

    /// Queues a packet if a worker is free, otherwise drops it.
    ///
    /// Returns `false` when the packet was dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::PipelineClosed`] after [`shutdown`](Self::shutdown).
    pub async fn try_submit(&self, packet: RawPacket) -> Result<bool> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                self.spawn(packet, permit).await;
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => {
                warn!(address = %packet.address, "Packet workers saturated; dropping packet");
                Ok(false)
            }
            Err(TryAcquireError::Closed) => Err(BeaconError::PipelineClosed),
        }
    }

    async fn spawn(&self, packet: RawPacket, permit: tokio::sync::OwnedSemaphorePermit) {
        let engine = Arc::clone(&self.engine);
        let mut in_flight = self.in_flight.lock().await;
        // Reap finished tasks so the set stays small between cycles.
        while let Some(done) = in_flight.try_join_next() {
            log_join_error(done);
        }
        in_flight.spawn_blocking(move || {
            let _permit = permit; // released when the packet is done
            engine.process_packet(&packet);
        });
    }

    /// Waits for every submitted packet, then closes the cycle.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::PipelineClosed`] if the finalizing task failed.
    pub async fn end_cycle(&self) -> Result<CycleReport> {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(done) = in_flight.join_next().await {
            log_join_error(done);
        }
        let engine = Arc::clone(&self.engine);
        let report = tokio::task::spawn_blocking(move || engine.on_cycle_end())
            .await
            .map_err(|e| {
                error!(error = %e, "Cycle finalization failed");
                BeaconError::PipelineClosed
            })?;
        // Held until here so no packet slips in between drain and finalize.
        drop(in_flight);
        Ok(report)
    }

    /// Stops accepting packets and waits for the ones in flight.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut in_flight = self.in_flight.lock().await;
        while let Some(done) = in_flight.join_next().await {
            log_join_error(done);
        }
        debug!("Scan pipeline drained");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

fn log_join_error(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Packet worker failed");
    }
}
