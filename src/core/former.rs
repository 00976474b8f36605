//! Network former: channel selection and PAN creation

use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::{
    config::FormerConfig,
    core::{
        channel_mask::{self, CHANNEL_COUNT, CHANNEL_MAX, CHANNEL_MIN, ChannelMask},
        error::{CommissioningError, CommissioningResult, ConfigError, ConfigResult},
        observer::CommissioningObserver,
        scan_queue::{SCAN_EVENT_CHANNEL_DEPTH, ScanQueue, ScanRequest},
        types::{
            ExtendedPanId, FormationOutcome, FormationStatus, InitialSecurityState,
            NetworkParameters, NetworkStatus, PanId, RunId, ScanEvent, ScanType, ZigbeeBeacon,
        },
    },
    stack::ZigbeeStack,
};

/// Per-channel composite score for one formation run
#[derive(Debug, Clone, Copy, Default)]
struct ChannelComposite {
    /// Beacons heard on the channel
    beacons: u16,
    /// Strongest corrected energy reading, if any
    max_rssi: Option<i8>,
    /// Lost a tie-break comparison; never retried within this run
    invalidated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormerStage {
    Primary,
    Secondary,
    LeastWorst,
}

#[derive(Debug)]
enum FormerPhase {
    /// Waiting for the active and energy scans of the current stage
    Scanning,
    /// Iterating formation candidates; `current` awaits a stack status
    Forming {
        remaining: VecDeque<u8>,
        current: Option<u8>,
    },
}

#[derive(Debug)]
struct FormerRun {
    run_id: RunId,
    stage: FormerStage,
    /// Channels still eligible; bits are cleared as channels are rejected
    mask: ChannelMask,
    composites: [ChannelComposite; CHANNEL_COUNT],
    phase: FormerPhase,
    used_secondary: bool,
    pan_id: PanId,
    extended_pan_id: ExtendedPanId,
    events: mpsc::Sender<ScanEvent>,
}

/// Channel-selection engine for creating a new PAN
///
/// Scans the configured masks, scores every channel by beacon count and peak
/// energy, and forms the network on a surviving channel, falling back from
/// the primary mask to the secondary and finally to the least-worst set of
/// channels with recorded readings.
pub struct NetworkFormer<S: ZigbeeStack> {
    stack: Arc<S>,
    queue: Arc<ScanQueue<S>>,
    observer: Arc<dyn CommissioningObserver>,
    config: Arc<RwLock<FormerConfig>>,
    run: Arc<Mutex<Option<FormerRun>>>,
}

impl<S: ZigbeeStack> Clone for NetworkFormer<S> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            queue: self.queue.clone(),
            observer: self.observer.clone(),
            config: self.config.clone(),
            run: self.run.clone(),
        }
    }
}

impl<S: ZigbeeStack> NetworkFormer<S> {
    pub fn new(
        stack: Arc<S>,
        queue: Arc<ScanQueue<S>>,
        config: FormerConfig,
        observer: Arc<dyn CommissioningObserver>,
    ) -> Self {
        Self {
            stack,
            queue,
            observer,
            config: Arc::new(RwLock::new(config)),
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a formation run on the primary mask
    ///
    /// Fails synchronously when a run is already active, the configuration is
    /// invalid, or the initial scans cannot be scheduled.
    pub async fn start(&self) -> CommissioningResult<()> {
        let config = *self.config.read().await;
        config.validate()?;

        let mut guard = self.run.lock().await;
        if guard.is_some() {
            return Err(CommissioningError::OperationInProgress);
        }

        let (events_tx, mut events_rx) = mpsc::channel(SCAN_EVENT_CHANNEL_DEPTH);
        let run = FormerRun {
            run_id: RunId::new(),
            stage: FormerStage::Primary,
            mask: config.primary_mask,
            composites: [ChannelComposite::default(); CHANNEL_COUNT],
            phase: FormerPhase::Scanning,
            used_secondary: false,
            pan_id: config.pan_id.unwrap_or_else(PanId::random),
            extended_pan_id: config.extended_pan_id.unwrap_or_else(ExtendedPanId::random),
            events: events_tx,
        };
        info!(
            run_id = %run.run_id,
            mask = %run.mask,
            pan_id = %run.pan_id,
            mode = ?config.security_mode,
            "starting network formation"
        );

        self.stack
            .set_initial_security_state(InitialSecurityState {
                mode: config.security_mode,
                preconfigured_key: None,
            })
            .await?;
        self.schedule_stage_scans(&config, config.primary_mask, &run.events)
            .await?;
        *guard = Some(run);
        drop(guard);

        let former = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                former.handle_scan_event(event).await;
            }
        });
        Ok(())
    }

    /// Abort the active run, reporting a stopped outcome
    pub async fn stop(&self) {
        let outcome = {
            let mut guard = self.run.lock().await;
            guard.take().map(|run| {
                info!(run_id = %run.run_id, "formation stopped");
                self.outcome(&run, FormationStatus::Stopped)
            })
        };
        if let Some(outcome) = outcome {
            self.complete(outcome);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Channels still eligible in the active run
    pub async fn eligible_mask(&self) -> Option<ChannelMask> {
        self.run.lock().await.as_ref().map(|run| run.mask)
    }

    pub async fn primary_mask(&self) -> ChannelMask {
        self.config.read().await.primary_mask
    }

    pub async fn set_primary_mask(&self, mask: ChannelMask) -> ConfigResult<()> {
        ChannelMask::from_bits(mask.bits())?;
        if mask.is_empty() {
            return Err(ConfigError::EmptyMask);
        }
        self.config.write().await.primary_mask = mask;
        Ok(())
    }

    pub async fn secondary_mask(&self) -> ChannelMask {
        self.config.read().await.effective_secondary_mask()
    }

    /// Override the secondary mask; `None` restores the complement default
    pub async fn set_secondary_mask(&self, mask: Option<ChannelMask>) -> ConfigResult<()> {
        if let Some(mask) = mask {
            ChannelMask::from_bits(mask.bits())?;
            if mask.is_empty() {
                return Err(ConfigError::EmptyMask);
            }
        }
        self.config.write().await.secondary_mask = mask;
        Ok(())
    }

    /// Process a scan event delivered by the queue
    pub async fn handle_scan_event(&self, event: ScanEvent) {
        let outcome = {
            let mut guard = self.run.lock().await;
            let Some(run) = guard.as_mut() else { return };
            let config = *self.config.read().await;
            let outcome = self.process_scan_event(run, &config, event).await;
            if outcome.is_some() {
                *guard = None;
            }
            outcome
        };
        if let Some(outcome) = outcome {
            self.complete(outcome);
        }
    }

    /// Process a deferred stack-status event following a form request
    pub async fn handle_stack_status(&self, status: NetworkStatus) {
        let outcome = {
            let mut guard = self.run.lock().await;
            let Some(run) = guard.as_mut() else { return };
            let config = *self.config.read().await;
            let outcome = self.process_stack_status(run, &config, status).await;
            if outcome.is_some() {
                *guard = None;
            }
            outcome
        };
        if let Some(outcome) = outcome {
            self.complete(outcome);
        }
    }

    async fn process_scan_event(
        &self,
        run: &mut FormerRun,
        config: &FormerConfig,
        event: ScanEvent,
    ) -> Option<FormationOutcome> {
        match event {
            ScanEvent::Beacon(beacon) => {
                record_beacon(run, config, &beacon);
                None
            }
            ScanEvent::Energy { channel, rssi } => {
                record_energy(run, config, channel, rssi);
                None
            }
            ScanEvent::Complete {
                scan_type: ScanType::Active,
                ..
            } => {
                debug!(run_id = %run.run_id, "active scan complete");
                None
            }
            ScanEvent::Complete {
                scan_type: ScanType::Energy,
                ..
            } => self.begin_formation(run, config).await,
            ScanEvent::Failed {
                channel: Some(channel),
                scan_type,
                status,
            } => {
                warn!(channel, ?status, "scan failed, disqualifying channel");
                run.mask.remove(channel);
                if !matches!(run.phase, FormerPhase::Scanning) {
                    return None;
                }
                if run.mask.is_empty() {
                    return self.continue_formation(run, config).await;
                }
                let request = ScanRequest {
                    scan_type,
                    channel_mask: run.mask,
                    duration: config.scan_duration,
                    handler: run.events.clone(),
                };
                match self.queue.schedule_scan(request).await {
                    Ok(()) => None,
                    Err(error) => {
                        warn!(%error, "could not reschedule scan, aborting run");
                        Some(self.outcome(run, FormationStatus::ScheduleFailed))
                    }
                }
            }
            ScanEvent::Failed {
                channel: None,
                status,
                ..
            } => {
                warn!(?status, "scan could not be issued, aborting run");
                Some(self.outcome(run, FormationStatus::ScheduleFailed))
            }
        }
    }

    async fn process_stack_status(
        &self,
        run: &mut FormerRun,
        config: &FormerConfig,
        status: NetworkStatus,
    ) -> Option<FormationOutcome> {
        let current = match &mut run.phase {
            FormerPhase::Forming { current, .. } => current,
            FormerPhase::Scanning => return None,
        };
        let Some(channel) = *current else { return None };

        match status {
            NetworkStatus::NetworkUp => {
                info!(run_id = %run.run_id, channel, pan_id = %run.pan_id, "network formed");
                Some(FormationOutcome {
                    run_id: run.run_id,
                    status: FormationStatus::Success,
                    parameters: Some(NetworkParameters {
                        channel,
                        pan_id: run.pan_id,
                        extended_pan_id: run.extended_pan_id,
                        tx_power: config.tx_power,
                    }),
                    used_secondary_mask: run.used_secondary,
                })
            }
            NetworkStatus::FormationFailed | NetworkStatus::NetworkDown => {
                warn!(channel, "stack reported formation failure, trying next channel");
                *current = None;
                run.mask.remove(channel);
                self.continue_formation(run, config).await
            }
            NetworkStatus::JoinFailed => None,
        }
    }

    /// The stage's energy scan finished: move from surveying to forming
    async fn begin_formation(
        &self,
        run: &mut FormerRun,
        config: &FormerConfig,
    ) -> Option<FormationOutcome> {
        if !matches!(run.phase, FormerPhase::Scanning) {
            return None;
        }
        if run.mask.is_empty() {
            return self.continue_formation(run, config).await;
        }
        let start = rand::thread_rng().gen_range(CHANNEL_MIN..=CHANNEL_MAX);
        let remaining: VecDeque<u8> = run.mask.iter_from(start).collect();
        info!(
            run_id = %run.run_id,
            eligible = %run.mask,
            start,
            "survey complete, attempting formation"
        );
        run.phase = FormerPhase::Forming {
            remaining,
            current: None,
        };
        self.continue_formation(run, config).await
    }

    /// Drive the run forward: try formation candidates, then fall back
    /// through the stages until a form request is accepted, new scans are
    /// scheduled, or every option is exhausted
    async fn continue_formation(
        &self,
        run: &mut FormerRun,
        config: &FormerConfig,
    ) -> Option<FormationOutcome> {
        loop {
            if let FormerPhase::Forming { remaining, current } = &mut run.phase {
                if current.is_some() {
                    return None;
                }
                while let Some(channel) = remaining.pop_front() {
                    let parameters = NetworkParameters {
                        channel,
                        pan_id: run.pan_id,
                        extended_pan_id: run.extended_pan_id,
                        tx_power: config.tx_power,
                    };
                    match self.stack.form_network(parameters).await {
                        Ok(()) => {
                            debug!(channel, "form request accepted, awaiting network up");
                            *current = Some(channel);
                            return None;
                        }
                        Err(error) => {
                            debug!(channel, %error, "form request rejected");
                        }
                    }
                }
            }

            match run.stage {
                FormerStage::Primary => {
                    run.stage = FormerStage::Secondary;
                    run.used_secondary = true;
                    let mask = config.effective_secondary_mask();
                    info!(
                        run_id = %run.run_id,
                        %mask,
                        "primary mask exhausted, scanning secondary mask"
                    );
                    for channel in mask.iter() {
                        if let Some(index) = channel_mask::index_of(channel) {
                            run.composites[index] = ChannelComposite::default();
                        }
                    }
                    run.mask = mask;
                    run.phase = FormerPhase::Scanning;
                    return match self.schedule_stage_scans(config, mask, &run.events).await {
                        Ok(()) => None,
                        Err(error) => {
                            warn!(%error, "failed to schedule secondary scans");
                            Some(self.outcome(run, FormationStatus::ScheduleFailed))
                        }
                    };
                }
                FormerStage::Secondary => {
                    run.stage = FormerStage::LeastWorst;
                    let candidates = least_worst_candidates(&run.composites);
                    if candidates.is_empty() {
                        info!(run_id = %run.run_id, "no channel has a recorded reading, giving up");
                        return Some(self.outcome(run, FormationStatus::Exhausted));
                    }
                    let mut mask = ChannelMask::EMPTY;
                    for &channel in &candidates {
                        mask.insert(channel);
                    }
                    info!(
                        run_id = %run.run_id,
                        %mask,
                        "every channel disqualified, retrying least-worst set"
                    );
                    run.mask = mask;
                    run.phase = FormerPhase::Forming {
                        remaining: candidates,
                        current: None,
                    };
                }
                FormerStage::LeastWorst => {
                    info!(run_id = %run.run_id, "least-worst set exhausted, formation failed");
                    return Some(self.outcome(run, FormationStatus::Exhausted));
                }
            }
        }
    }

    async fn schedule_stage_scans(
        &self,
        config: &FormerConfig,
        mask: ChannelMask,
        events: &mpsc::Sender<ScanEvent>,
    ) -> CommissioningResult<()> {
        // Active scan first, then energy, in that order.
        self.queue
            .schedule_scan(ScanRequest {
                scan_type: ScanType::Active,
                channel_mask: mask,
                duration: config.scan_duration,
                handler: events.clone(),
            })
            .await?;
        self.queue
            .schedule_scan(ScanRequest {
                scan_type: ScanType::Energy,
                channel_mask: mask,
                duration: config.scan_duration,
                handler: events.clone(),
            })
            .await?;
        Ok(())
    }

    fn outcome(&self, run: &FormerRun, status: FormationStatus) -> FormationOutcome {
        FormationOutcome {
            run_id: run.run_id,
            status,
            parameters: None,
            used_secondary_mask: run.used_secondary,
        }
    }

    fn complete(&self, outcome: FormationOutcome) {
        info!(run_id = %outcome.run_id, status = ?outcome.status, "formation run complete");
        self.observer.formation_complete(&outcome);
    }
}

fn record_beacon(run: &mut FormerRun, config: &FormerConfig, beacon: &ZigbeeBeacon) {
    let Some(index) = channel_mask::index_of(beacon.channel) else {
        return;
    };
    let composite = &mut run.composites[index];
    composite.beacons = composite.beacons.saturating_add(1);
    let beacons = composite.beacons;
    if run.mask.contains(beacon.channel) && beacons > config.beacon_threshold {
        debug!(
            channel = beacon.channel,
            beacons, "beacon threshold crossed, dropping channel"
        );
        run.mask.remove(beacon.channel);
    }
}

fn record_energy(run: &mut FormerRun, config: &FormerConfig, channel: u8, rssi: i8) {
    let Some(index) = channel_mask::index_of(channel) else {
        return;
    };
    let corrected = rssi.saturating_add(config.rssi_correction);
    let composite = &mut run.composites[index];
    if composite.max_rssi.map_or(true, |max| corrected > max) {
        composite.max_rssi = Some(corrected);
    }
    let max = match composite.max_rssi {
        Some(max) => max,
        None => return,
    };
    if !run.mask.contains(channel) || max <= config.rssi_threshold {
        return;
    }

    if run.mask.count() > config.channels_to_consider {
        debug!(channel, rssi = max, "energy threshold crossed, dropping channel");
        run.mask.remove(channel);
        return;
    }

    // At or below the candidate budget: evict the worse of this channel and
    // the loudest surviving one, and remember the loser as already tried.
    let loudest = run
        .mask
        .iter()
        .filter(|&other| other != channel)
        .filter_map(|other| {
            channel_mask::index_of(other)
                .and_then(|i| run.composites[i].max_rssi.map(|r| (other, r)))
        })
        .max_by_key(|&(_, r)| r);
    match loudest {
        Some((other, other_rssi)) if other_rssi > max => {
            debug!(
                kept = channel,
                dropped = other,
                "tie-break evicted loudest surviving channel"
            );
            run.mask.remove(other);
            if let Some(i) = channel_mask::index_of(other) {
                run.composites[i].invalidated = true;
            }
        }
        _ => {
            debug!(channel, rssi = max, "tie-break evicted offending channel");
            run.mask.remove(channel);
            run.composites[index].invalidated = true;
        }
    }
}

/// Channels with any recorded reading, quietest first
///
/// Channels evicted by a tie-break already lost a direct comparison and are
/// skipped unless nothing else has a reading.
fn least_worst_candidates(composites: &[ChannelComposite; CHANNEL_COUNT]) -> VecDeque<u8> {
    let mut scored: Vec<(u8, i8)> = composites
        .iter()
        .enumerate()
        .filter(|(_, composite)| !composite.invalidated)
        .filter_map(|(index, composite)| {
            composite
                .max_rssi
                .map(|rssi| (channel_mask::channel_at(index), rssi))
        })
        .collect();
    if scored.is_empty() {
        scored = composites
            .iter()
            .enumerate()
            .filter_map(|(index, composite)| {
                composite
                    .max_rssi
                    .map(|rssi| (channel_mask::channel_at(index), rssi))
            })
            .collect();
    }
    scored.sort_by_key(|&(_, rssi)| rssi);
    scored.into_iter().map(|(channel, _)| channel).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observer::RecordingObserver;
    use crate::stack::MockZigbeeStack;

    fn mask_of(channels: &[u8]) -> ChannelMask {
        let mut mask = ChannelMask::EMPTY;
        for &channel in channels {
            mask.insert(channel);
        }
        mask
    }

    fn beacon(channel: u8) -> ZigbeeBeacon {
        ZigbeeBeacon {
            channel,
            pan_id: PanId::new(0x4444),
            extended_pan_id: ExtendedPanId::new([9; 8]),
            permit_joining: true,
            stack_profile: 2,
            nwk_update_id: 0,
            lqi: 200,
            rssi: -60,
        }
    }

    fn setup(
        config: FormerConfig,
    ) -> (
        Arc<MockZigbeeStack>,
        NetworkFormer<MockZigbeeStack>,
        Arc<RecordingObserver>,
    ) {
        let stack = Arc::new(MockZigbeeStack::new());
        let queue = Arc::new(ScanQueue::new(stack.clone()));
        let observer = Arc::new(RecordingObserver::new());
        let former = NetworkFormer::new(stack.clone(), queue, config, observer.clone());
        (stack, former, observer)
    }

    async fn finish_scans(former: &NetworkFormer<MockZigbeeStack>) {
        former
            .handle_scan_event(ScanEvent::Complete {
                scan_type: ScanType::Active,
                channel: 0,
            })
            .await;
        former
            .handle_scan_event(ScanEvent::Complete {
                scan_type: ScanType::Energy,
                channel: 0,
            })
            .await;
    }

    #[tokio::test]
    async fn test_beacon_threshold_clears_channel_mid_scan() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11, 15, 20]),
            beacon_threshold: 3,
            ..Default::default()
        };
        let (stack, former, observer) = setup(config);
        former.start().await.unwrap();

        // Five beacons on channel 11 cross the threshold before the active
        // scan for the mask completes.
        for _ in 0..5 {
            former.handle_scan_event(ScanEvent::Beacon(beacon(11))).await;
        }
        assert_eq!(former.eligible_mask().await, Some(mask_of(&[15, 20])));

        finish_scans(&former).await;

        let forms = stack.form_calls().await;
        assert!(!forms.is_empty());
        assert!(
            forms
                .iter()
                .all(|parameters| parameters.channel == 15 || parameters.channel == 20)
        );

        former.handle_stack_status(NetworkStatus::NetworkUp).await;
        let outcomes = observer.formations();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FormationStatus::Success);
        assert!(!outcomes[0].used_secondary_mask);
        let parameters = outcomes[0].parameters.unwrap();
        assert!(parameters.channel == 15 || parameters.channel == 20);
    }

    #[tokio::test]
    async fn test_composite_threshold_idempotence() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11, 15, 20]),
            rssi_threshold: -48,
            ..Default::default()
        };
        let (_stack, former, _observer) = setup(config);

        let mut masks = Vec::new();
        for _ in 0..2 {
            former.start().await.unwrap();
            for (channel, rssi) in [(15, -80), (20, -85), (11, -30)] {
                former
                    .handle_scan_event(ScanEvent::Energy { channel, rssi })
                    .await;
            }
            masks.push(former.eligible_mask().await.unwrap());
            former.stop().await;
        }
        assert_eq!(masks[0], masks[1]);
        assert_eq!(masks[0], mask_of(&[15, 20]));
    }

    #[tokio::test]
    async fn test_eviction_paths_by_channel_budget() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11, 12, 13]),
            rssi_threshold: -70,
            channels_to_consider: 2,
            ..Default::default()
        };
        let (_stack, former, _observer) = setup(config);
        former.start().await.unwrap();

        // Three survivors exceed the budget of two: plain threshold drop.
        former
            .handle_scan_event(ScanEvent::Energy {
                channel: 11,
                rssi: -60,
            })
            .await;
        assert_eq!(former.eligible_mask().await, Some(mask_of(&[12, 13])));

        // At the budget the drop becomes comparative and the loser is
        // remembered as already tried.
        former
            .handle_scan_event(ScanEvent::Energy {
                channel: 12,
                rssi: -55,
            })
            .await;
        assert_eq!(former.eligible_mask().await, Some(mask_of(&[13])));
    }

    #[tokio::test]
    async fn test_least_worst_fallback_attempts_formation() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11]),
            secondary_mask: Some(mask_of(&[12])),
            rssi_threshold: -70,
            ..Default::default()
        };
        let (stack, former, observer) = setup(config);
        former.start().await.unwrap();

        // Primary: the only channel is disqualified by energy.
        former
            .handle_scan_event(ScanEvent::Energy {
                channel: 11,
                rssi: -60,
            })
            .await;
        finish_scans(&former).await;
        // Secondary: same story.
        former
            .handle_scan_event(ScanEvent::Energy {
                channel: 12,
                rssi: -55,
            })
            .await;
        finish_scans(&former).await;

        // Least-worst fallback retries every channel with a reading,
        // quietest first.
        let forms = stack.form_calls().await;
        assert!(!forms.is_empty());
        assert_eq!(forms[0].channel, 11);

        former.handle_stack_status(NetworkStatus::NetworkUp).await;
        let outcomes = observer.formations();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FormationStatus::Success);
        assert!(outcomes[0].used_secondary_mask);
    }

    #[tokio::test]
    async fn test_rejected_channel_skipped() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11, 15]),
            ..Default::default()
        };
        let (stack, former, observer) = setup(config);
        stack.reject_form_on(mask_of(&[11])).await;
        former.start().await.unwrap();
        finish_scans(&former).await;

        let forms = stack.form_calls().await;
        assert_eq!(forms.last().unwrap().channel, 15);

        former.handle_stack_status(NetworkStatus::NetworkUp).await;
        let outcomes = observer.formations();
        assert_eq!(outcomes[0].status, FormationStatus::Success);
        assert_eq!(outcomes[0].parameters.unwrap().channel, 15);
    }

    #[tokio::test]
    async fn test_stack_failure_after_accept_tries_next_channel() {
        let config = FormerConfig {
            primary_mask: mask_of(&[11, 15]),
            ..Default::default()
        };
        let (stack, former, observer) = setup(config);
        former.start().await.unwrap();
        finish_scans(&former).await;

        assert_eq!(stack.form_calls().await.len(), 1);
        former
            .handle_stack_status(NetworkStatus::FormationFailed)
            .await;

        let forms = stack.form_calls().await;
        assert_eq!(forms.len(), 2);
        assert_ne!(forms[0].channel, forms[1].channel);

        former.handle_stack_status(NetworkStatus::NetworkUp).await;
        assert_eq!(observer.formations()[0].status, FormationStatus::Success);
    }

    #[tokio::test]
    async fn test_schedule_failure_aborts_start() {
        let stack = Arc::new(MockZigbeeStack::new());
        let queue = Arc::new(ScanQueue::with_capacity(stack.clone(), 1));
        let observer = Arc::new(RecordingObserver::new());
        let former = NetworkFormer::new(
            stack,
            queue,
            FormerConfig::default(),
            observer.clone(),
        );

        let result = former.start().await;
        assert!(matches!(result, Err(CommissioningError::QueueFull)));
        assert!(!former.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_reports_stopped() {
        let (_stack, former, observer) = setup(FormerConfig::default());
        former.start().await.unwrap();
        former.stop().await;

        let outcomes = observer.formations();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FormationStatus::Stopped);
        assert!(!former.is_running().await);
    }

    #[tokio::test]
    async fn test_start_while_running_rejected() {
        let (_stack, former, _observer) = setup(FormerConfig::default());
        former.start().await.unwrap();
        assert!(matches!(
            former.start().await,
            Err(CommissioningError::OperationInProgress)
        ));
    }

    #[tokio::test]
    async fn test_mask_accessors() {
        let (_stack, former, _observer) = setup(FormerConfig::default());
        let mask = mask_of(&[11, 12, 13]);
        former.set_primary_mask(mask).await.unwrap();
        assert_eq!(former.primary_mask().await, mask);
        assert_eq!(former.secondary_mask().await, mask.complement());

        assert!(former.set_primary_mask(ChannelMask::EMPTY).await.is_err());

        let secondary = mask_of(&[20]);
        former.set_secondary_mask(Some(secondary)).await.unwrap();
        assert_eq!(former.secondary_mask().await, secondary);
    }
}
