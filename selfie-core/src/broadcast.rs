//! Reliable fan-out of one payload to a snapshot of connected peers.
//!
//! Failures are classified per peer; one unreachable peer never blocks the rest.
//! A single worker drains broadcasts in submission order, which keeps delivery ordered
//! per peer across broadcasts without holding the roster during the send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SendError, TransportError};
use crate::identity::PeerIdentity;
use crate::transport::{DiscoveryTransport, Reliability};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerIdentity>,
    pub failed: Vec<SendError>,
}

impl BroadcastReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    fn all_failed(peers: Vec<PeerIdentity>, cause: TransportError) -> Self {
        Self {
            delivered: Vec::new(),
            failed: peers
                .into_iter()
                .map(|peer| SendError {
                    peer,
                    cause: cause.clone(),
                })
                .collect(),
        }
    }
}

/// Send `bytes` to `peers` and classify the result per peer, in snapshot order.
/// An empty snapshot succeeds with zero deliveries.
pub async fn broadcast(
    transport: &dyn DiscoveryTransport,
    bytes: &[u8],
    peers: &[PeerIdentity],
    reliability: Reliability,
) -> BroadcastReport {
    if peers.is_empty() {
        return BroadcastReport::default();
    }
    let mut outcomes = transport.send(bytes, peers, reliability).await;
    let mut report = BroadcastReport::default();
    for peer in peers {
        let result = match outcomes.iter().position(|(p, _)| p == peer) {
            Some(i) => outcomes.swap_remove(i).1,
            None => Err(TransportError::NoResult),
        };
        match result {
            Ok(()) => report.delivered.push(peer.clone()),
            Err(cause) => {
                warn!(peer = %peer, %cause, "broadcast: delivery failed");
                report.failed.push(SendError {
                    peer: peer.clone(),
                    cause,
                });
            }
        }
    }
    for (peer, _) in outcomes {
        warn!(peer = %peer, "broadcast: transport reported a peer outside the snapshot");
    }
    report
}

struct BroadcastJob {
    epoch: u64,
    bytes: Vec<u8>,
    peers: Vec<PeerIdentity>,
}

/// Serial broadcast worker. Jobs submitted before [`Broadcaster::cancel_pending`] fail
/// fast with `SessionClosed` instead of reaching the transport.
pub struct Broadcaster {
    jobs: mpsc::UnboundedSender<BroadcastJob>,
    epoch: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn spawn(
        transport: Arc<dyn DiscoveryTransport>,
        reliability: Reliability,
        reports: mpsc::UnboundedSender<BroadcastReport>,
    ) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<BroadcastJob>();
        let epoch = Arc::new(AtomicU64::new(0));
        let worker_epoch = epoch.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let report = if job.epoch != worker_epoch.load(Ordering::SeqCst) {
                    debug!(peers = job.peers.len(), "broadcast: dropping job from closed session");
                    BroadcastReport::all_failed(job.peers, TransportError::SessionClosed)
                } else {
                    broadcast(transport.as_ref(), &job.bytes, &job.peers, reliability).await
                };
                if reports.send(report).is_err() {
                    break;
                }
            }
        });
        Self { jobs, epoch }
    }

    /// Queue a broadcast to an immutable snapshot of peers.
    pub fn submit(&self, bytes: Vec<u8>, peers: Vec<PeerIdentity>) -> Result<(), TransportError> {
        let job = BroadcastJob {
            epoch: self.epoch.load(Ordering::SeqCst),
            bytes,
            peers,
        };
        self.jobs
            .send(job)
            .map_err(|_| TransportError::Other("broadcast worker stopped".into()))
    }

    /// Fail every job queued so far.
    pub fn cancel_pending(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}
