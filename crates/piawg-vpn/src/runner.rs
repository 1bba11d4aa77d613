//! Bounded concurrent probing of a region list.

use crate::probe::{LatencyProber, Pinger};
use crate::region::{LATENCY_FAILED, Region};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Latency of one region, keyed by its slot in the caller's slice
#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    index: usize,
    latency_ms: u16,
}

/// Probes every region once with at most `concurrency` probes in flight
pub struct ProbeRunner<P> {
    prober: Arc<LatencyProber<P>>,
    concurrency: usize,
    samples: u8,
}

impl<P: Pinger + 'static> ProbeRunner<P> {
    pub fn new(prober: LatencyProber<P>, concurrency: usize, samples: u8) -> Self {
        Self {
            prober: Arc::new(prober),
            concurrency,
            samples,
        }
    }

    /// Probe all regions and store the results in place
    ///
    /// Returns once every probe has finished. Failed probes store
    /// [`LATENCY_FAILED`]; nothing is propagated to the caller.
    pub async fn run_all(&self, regions: &mut [Region]) {
        if self.concurrency == 0 || regions.is_empty() {
            return;
        }

        info!(
            "Probing {} regions ({} workers, {} samples)",
            regions.len(),
            self.concurrency,
            self.samples
        );

        // Permits beyond the region count would never be used
        let permits = Arc::new(Semaphore::new(self.concurrency.min(regions.len())));
        let mut tasks = JoinSet::new();

        for (index, region) in regions.iter().enumerate() {
            let permits = permits.clone();
            let prober = self.prober.clone();
            let host = region.control_host.clone();
            let samples = self.samples;

            tasks.spawn(async move {
                // The semaphore is never closed, so acquire only fails on a bug
                let _permit = permits.acquire_owned().await.ok();
                let latency_ms = prober.probe_or_sentinel(&host, samples).await;
                ProbeResult { index, latency_ms }
            });
        }

        debug!("Waiting on {} probes", tasks.len());

        let mut results: Vec<Option<u16>> = vec![None; regions.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results[result.index] = Some(result.latency_ms),
                Err(e) => error!("Probe task failed: {}", e),
            }
        }

        for (region, latency) in regions.iter_mut().zip(results) {
            region.latency_ms = latency.unwrap_or(LATENCY_FAILED);
            debug!("Region pinged: {} = {}ms", region.id, region.latency_ms);
        }
    }
}
