//! Commissioning service facade and stack-event routing

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::{
    config::{EngineSettings, JoinerConfig},
    core::{
        error::{CommissioningError, CommissioningResult, ConfigResult},
        former::NetworkFormer,
        joiner::NetworkJoiner,
        observer::CommissioningObserver,
        scan_queue::ScanQueue,
        types::StackEvent,
    },
    stack::ZigbeeStack,
};

/// Commissioning engine facade
///
/// Owns the shared scan queue, the network former and one network joiner per
/// logical network index (multi-PAN hardware), and routes asynchronous stack
/// events to the component that owns them. Former and joiners are mutually
/// exclusive users of the one radio, serialized by the scan queue.
pub struct CommissioningService<S: ZigbeeStack> {
    stack: Arc<S>,
    observer: Arc<dyn CommissioningObserver>,
    queue: Arc<ScanQueue<S>>,
    former: NetworkFormer<S>,
    joiners: Arc<RwLock<Vec<NetworkJoiner<S>>>>,
}

impl<S: ZigbeeStack> Clone for CommissioningService<S> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            observer: self.observer.clone(),
            queue: self.queue.clone(),
            former: self.former.clone(),
            joiners: self.joiners.clone(),
        }
    }
}

impl<S: ZigbeeStack> CommissioningService<S> {
    /// Create the engine with one joiner for the settings' network index
    pub fn new(
        stack: Arc<S>,
        settings: EngineSettings,
        observer: Arc<dyn CommissioningObserver>,
    ) -> ConfigResult<Self> {
        settings.validate()?;
        let queue = Arc::new(ScanQueue::with_capacity(
            stack.clone(),
            settings.scan_queue_capacity,
        ));
        let former = NetworkFormer::new(
            stack.clone(),
            queue.clone(),
            settings.former,
            observer.clone(),
        );
        let joiner = NetworkJoiner::new(
            stack.clone(),
            queue.clone(),
            settings.joiner,
            observer.clone(),
        );
        Ok(Self {
            stack,
            observer,
            queue,
            former,
            joiners: Arc::new(RwLock::new(vec![joiner])),
        })
    }

    /// Register a joiner for an additional logical network
    pub async fn add_network(
        &self,
        config: JoinerConfig,
    ) -> CommissioningResult<NetworkJoiner<S>> {
        config.validate()?;
        let mut joiners = self.joiners.write().await;
        if joiners
            .iter()
            .any(|joiner| joiner.network_index() == config.network_index)
        {
            return Err(CommissioningError::DuplicateNetworkIndex(
                config.network_index,
            ));
        }
        let joiner = NetworkJoiner::new(
            self.stack.clone(),
            self.queue.clone(),
            config,
            self.observer.clone(),
        );
        joiners.push(joiner.clone());
        Ok(joiner)
    }

    pub fn former(&self) -> &NetworkFormer<S> {
        &self.former
    }

    /// Joiner registered for the given logical network
    pub async fn joiner(&self, network_index: u8) -> CommissioningResult<NetworkJoiner<S>> {
        self.joiners
            .read()
            .await
            .iter()
            .find(|joiner| joiner.network_index() == network_index)
            .cloned()
            .ok_or(CommissioningError::UnknownNetworkIndex(network_index))
    }

    /// Start forming a new network
    pub async fn start_formation(&self) -> CommissioningResult<()> {
        self.former.start().await
    }

    /// Stop the active formation run
    pub async fn stop_formation(&self) {
        self.former.stop().await;
    }

    /// Start joining on the given logical network
    pub async fn start_joining(&self, network_index: u8) -> CommissioningResult<()> {
        self.joiner(network_index).await?.start().await
    }

    /// Request a stop of the joining run on the given logical network
    pub async fn stop_joining(&self, network_index: u8) -> CommissioningResult<()> {
        self.joiner(network_index).await?.stop().await;
        Ok(())
    }

    /// Abort every run and clear the scan queue
    ///
    /// Pending scans are aborted at the radio, so deferred joiner stops would
    /// never see their scan-complete event; runs are cancelled immediately
    /// instead.
    pub async fn emergency_stop(&self) {
        info!("emergency stop");
        self.former.stop().await;
        let joiners = self.joiners.read().await.clone();
        for joiner in joiners {
            joiner.abort().await;
        }
        self.queue.clear().await;
    }

    /// Route one asynchronous stack event to its owner
    pub async fn handle_stack_event(&self, event: StackEvent) {
        match event {
            StackEvent::Scan(event) => self.queue.handle_scan_event(event).await,
            StackEvent::Status(status) => {
                self.former.handle_stack_status(status).await;
                let joiners = self.joiners.read().await.clone();
                for joiner in joiners {
                    joiner.handle_stack_status(status).await;
                }
            }
            StackEvent::KeyUpdate(event) => {
                let joiners = self.joiners.read().await.clone();
                for joiner in joiners {
                    joiner.handle_key_update(event).await;
                }
            }
        }
    }

    /// Spawn the event loop draining stack events into the engine
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::Receiver<StackEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                service.handle_stack_event(event).await;
            }
            debug!("stack event channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::FormerConfig;
    use crate::core::channel_mask::ChannelMask;
    use crate::core::observer::RecordingObserver;
    use crate::core::types::{
        ExtendedPanId, FormationStatus, JoiningStatus, KeyUpdateEvent, NetworkStatus, PanId,
        RadioScanEvent, ScanStatus, ZigbeeBeacon,
    };
    use crate::stack::MockZigbeeStack;

    fn setup() -> (
        Arc<MockZigbeeStack>,
        CommissioningService<MockZigbeeStack>,
        Arc<RecordingObserver>,
    ) {
        let stack = Arc::new(MockZigbeeStack::new());
        let observer = Arc::new(RecordingObserver::new());
        let service =
            CommissioningService::new(stack.clone(), EngineSettings::default(), observer.clone())
                .unwrap();
        (stack, service, observer)
    }

    fn beacon(channel: u8, pan: u16) -> ZigbeeBeacon {
        ZigbeeBeacon {
            channel,
            pan_id: PanId::new(pan),
            extended_pan_id: ExtendedPanId::new([0x11; 8]),
            permit_joining: true,
            stack_profile: 2,
            nwk_update_id: 0,
            lqi: 190,
            rssi: -50,
        }
    }

    async fn pump(service: &CommissioningService<MockZigbeeStack>, event: StackEvent) {
        service.handle_stack_event(event).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let stack = Arc::new(MockZigbeeStack::new());
        let observer = Arc::new(RecordingObserver::new());
        let settings = EngineSettings {
            former: FormerConfig {
                primary_mask: ChannelMask::EMPTY,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(CommissioningService::new(stack, settings, observer).is_err());
    }

    #[tokio::test]
    async fn test_formation_workflow_through_event_pump() {
        let (stack, service, observer) = setup();
        service.start_formation().await.unwrap();

        // Quiet airwaves: both scans complete with nothing heard.
        for _ in 0..2 {
            pump(
                &service,
                StackEvent::Scan(RadioScanEvent::ScanComplete {
                    channel: 0,
                    status: ScanStatus::Success,
                }),
            )
            .await;
        }
        assert!(!stack.form_calls().await.is_empty());

        pump(&service, StackEvent::Status(NetworkStatus::NetworkUp)).await;
        let outcomes = observer.formations();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FormationStatus::Success);
    }

    #[tokio::test]
    async fn test_joining_workflow_through_event_pump() {
        let (_stack, service, observer) = setup();
        service.start_joining(0).await.unwrap();

        pump(
            &service,
            StackEvent::Scan(RadioScanEvent::NetworkFound {
                beacon: beacon(11, 0x1a2b),
            }),
        )
        .await;
        pump(
            &service,
            StackEvent::Scan(RadioScanEvent::ScanComplete {
                channel: 0,
                status: ScanStatus::Success,
            }),
        )
        .await;
        pump(&service, StackEvent::Status(NetworkStatus::NetworkUp)).await;
        pump(&service, StackEvent::KeyUpdate(KeyUpdateEvent::Updated)).await;
        pump(&service, StackEvent::KeyUpdate(KeyUpdateEvent::Verified)).await;

        let outcomes = observer.joinings();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JoiningStatus::Success);
        assert_eq!(outcomes[0].network.unwrap().pan_id, PanId::new(0x1a2b));
    }

    #[tokio::test]
    async fn test_event_pump_task_drains_channel() {
        let (_stack, service, observer) = setup();
        service.start_joining(0).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let pump_task = service.spawn_event_pump(rx);

        tx.send(StackEvent::Scan(RadioScanEvent::NetworkFound {
            beacon: beacon(15, 0x0042),
        }))
        .await
        .unwrap();
        tx.send(StackEvent::Scan(RadioScanEvent::ScanComplete {
            channel: 0,
            status: ScanStatus::Success,
        }))
        .await
        .unwrap();
        // Scan events reach the joiner through its driver task; give it time
        // to issue the join before the stack status arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(StackEvent::Status(NetworkStatus::NetworkUp))
            .await
            .unwrap();
        tx.send(StackEvent::KeyUpdate(KeyUpdateEvent::Updated))
            .await
            .unwrap();
        tx.send(StackEvent::KeyUpdate(KeyUpdateEvent::Verified))
            .await
            .unwrap();
        drop(tx);
        pump_task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcomes = observer.joinings();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JoiningStatus::Success);
    }

    #[tokio::test]
    async fn test_multi_pan_joiners() {
        let (_stack, service, _observer) = setup();
        let second = service
            .add_network(JoinerConfig {
                network_index: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.network_index(), 1);

        // Index is taken now.
        let duplicate = service
            .add_network(JoinerConfig {
                network_index: 1,
                ..Default::default()
            })
            .await;
        assert!(matches!(
            duplicate,
            Err(CommissioningError::DuplicateNetworkIndex(1))
        ));

        assert!(service.joiner(0).await.is_ok());
        assert!(matches!(
            service.joiner(7).await,
            Err(CommissioningError::UnknownNetworkIndex(7))
        ));

        // Both joiners share the one scan queue.
        service.start_joining(0).await.unwrap();
        service.start_joining(1).await.unwrap();
        assert_eq!(service.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_emergency_stop_cancels_everything() {
        let (stack, service, observer) = setup();
        service.start_joining(0).await.unwrap();
        service.emergency_stop().await;

        assert!(service.queue.is_empty().await);
        assert_eq!(stack.abort_count().await, 1);
        let outcomes = observer.joinings();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JoiningStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_mask_accessors_via_facade() {
        let (_stack, service, _observer) = setup();
        let mask = ChannelMask::single(14).unwrap();
        service.former().set_primary_mask(mask).await.unwrap();
        assert_eq!(service.former().primary_mask().await, mask);

        let joiner = service.joiner(0).await.unwrap();
        joiner.set_primary_mask(mask).await.unwrap();
        assert_eq!(joiner.primary_mask().await, mask);
        assert_eq!(joiner.secondary_mask().await, mask.complement());
    }
}
