//! Bounded FIFO serializing scan requests onto the single radio

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    core::{
        channel_mask::ChannelMask,
        error::{CommissioningError, CommissioningResult, StackError},
        types::{RadioScanEvent, ScanDuration, ScanEvent, ScanStatus, ScanType},
    },
    stack::ZigbeeStack,
};

/// Default number of queued scan requests
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// Buffer depth of a consumer's scan-event channel
pub(crate) const SCAN_EVENT_CHANNEL_DEPTH: usize = 64;

/// One queued scan on behalf of a logical consumer
///
/// The request is owned by the queue until dispatched; results are delivered
/// to `handler` without transferring ownership of the request itself.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub scan_type: ScanType,
    pub channel_mask: ChannelMask,
    pub duration: ScanDuration,
    /// Consumer-side channel receiving every event of this scan
    pub handler: mpsc::Sender<ScanEvent>,
}

#[derive(Debug, Default)]
struct QueueInner {
    requests: VecDeque<ScanRequest>,
    /// The head request's hardware scan has been issued and not yet completed
    scanning: bool,
}

/// Serializes scan requests from multiple logical consumers onto the single
/// physical radio and fans raw scan events out to the head-of-queue handler
pub struct ScanQueue<S: ZigbeeStack> {
    stack: Arc<S>,
    capacity: usize,
    inner: Mutex<QueueInner>,
}

impl<S: ZigbeeStack> ScanQueue<S> {
    /// Create a queue with the default capacity
    pub fn new(stack: Arc<S>) -> Self {
        Self::with_capacity(stack, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(stack: Arc<S>, capacity: usize) -> Self {
        Self {
            stack,
            capacity,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Enqueue a scan request
    ///
    /// Fails with [`CommissioningError::QueueFull`] when every slot is taken.
    /// On success the request is dispatched immediately if the radio is idle;
    /// the underlying hardware scan may still start later.
    pub async fn schedule_scan(&self, request: ScanRequest) -> CommissioningResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.requests.len() >= self.capacity {
                return Err(CommissioningError::QueueFull);
            }
            debug!(
                scan_type = ?request.scan_type,
                mask = %request.channel_mask,
                queued = inner.requests.len(),
                "scan scheduled"
            );
            inner.requests.push_back(request);
        }
        self.dispatch().await;
        Ok(())
    }

    /// Abort any scan in progress and drop every queued request
    pub async fn clear(&self) {
        let (was_scanning, dropped) = {
            let mut inner = self.inner.lock().await;
            let was_scanning = inner.scanning;
            inner.scanning = false;
            let dropped = inner.requests.len();
            inner.requests.clear();
            (was_scanning, dropped)
        };
        if dropped > 0 {
            info!(dropped, "scan queue cleared");
        }
        if was_scanning {
            if let Err(error) = self.stack.abort_scan().await {
                warn!(%error, "failed to abort scan in progress");
            }
        }
    }

    /// Event-loop tick: issue the head request's scan if the radio is free
    pub async fn kick(&self) {
        self.dispatch().await;
    }

    /// Number of queued requests, including the active one
    pub async fn len(&self) -> usize {
        self.inner.lock().await.requests.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.requests.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forward a raw radio event to the owning handler
    ///
    /// Completion pops the head request and promotes the next one; events
    /// arriving while this queue has no scan outstanding belong to a foreign
    /// user of the radio and are not forwarded.
    pub async fn handle_scan_event(&self, event: RadioScanEvent) {
        let head = {
            let inner = self.inner.lock().await;
            if inner.scanning {
                inner.requests.front().cloned()
            } else {
                None
            }
        };
        let Some(head) = head else {
            if matches!(event, RadioScanEvent::ScanComplete { .. }) {
                debug!("scan completion without an owned scan, kicking dispatch");
                self.dispatch().await;
            }
            return;
        };

        match event {
            RadioScanEvent::EnergyReading { channel, rssi } => {
                let _ = head.handler.send(ScanEvent::Energy { channel, rssi }).await;
            }
            RadioScanEvent::NetworkFound { beacon } => {
                let _ = head.handler.send(ScanEvent::Beacon(beacon)).await;
            }
            RadioScanEvent::ScanComplete { channel, status } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.scanning = false;
                    inner.requests.pop_front();
                }
                let delivery = if status == ScanStatus::Success {
                    ScanEvent::Complete {
                        scan_type: head.scan_type,
                        channel,
                    }
                } else {
                    ScanEvent::Failed {
                        scan_type: head.scan_type,
                        channel: Some(channel),
                        status,
                    }
                };
                if head.handler.send(delivery).await.is_err() {
                    debug!("scan owner dropped its handler before completion");
                }
                self.dispatch().await;
            }
        }
    }

    /// Issue the hardware scan for the head request
    ///
    /// An `Err(ScanInProgress)` from the radio leaves the head pending for the
    /// next tick; any other rejection is reported to the owning handler and
    /// the queue advances.
    async fn dispatch(&self) {
        loop {
            let head = {
                let mut inner = self.inner.lock().await;
                if inner.scanning {
                    return;
                }
                let Some(head) = inner.requests.front().cloned() else {
                    return;
                };
                inner.scanning = true;
                head
            };
            match self
                .stack
                .begin_scan(head.scan_type, head.channel_mask, head.duration)
                .await
            {
                Ok(()) => return,
                Err(StackError::ScanInProgress) => {
                    debug!("radio busy with another scan, retrying on next tick");
                    self.inner.lock().await.scanning = false;
                    return;
                }
                Err(error) => {
                    warn!(%error, scan_type = ?head.scan_type, "failed to issue scan");
                    {
                        let mut inner = self.inner.lock().await;
                        inner.scanning = false;
                        inner.requests.pop_front();
                    }
                    let _ = head
                        .handler
                        .send(ScanEvent::Failed {
                            scan_type: head.scan_type,
                            channel: None,
                            status: ScanStatus::Failed,
                        })
                        .await;
                }
            }
        }
    }
}
