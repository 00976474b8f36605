//! Network joiner: staged search across channel-mask and key tiers

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::{
    config::JoinerConfig,
    core::{
        channel_mask::ChannelMask,
        error::{CommissioningError, CommissioningResult, ConfigError, ConfigResult},
        observer::CommissioningObserver,
        scan_queue::{SCAN_EVENT_CHANNEL_DEPTH, ScanQueue, ScanRequest},
        types::{
            CENTRALIZED_SECURITY_LINK_KEY, DISTRIBUTED_SECURITY_LINK_KEY, Eui64,
            InitialSecurityState, JoinerState, JoiningOutcome, JoiningStatus, KeyTier,
            KeyUpdateEvent, NetworkParameters, NetworkStatus, RunId, ScanEvent, ScanType,
            SecurityMode, ZigbeeBeacon,
        },
    },
    stack::ZigbeeStack,
};

#[derive(Debug, Clone, Copy)]
enum JoinPhase {
    /// Collecting beacons for the current state's scan
    Scanning,
    /// A join request was accepted; awaiting the stack status
    Joining {
        beacon: ZigbeeBeacon,
        rejoin_attempts: u8,
    },
}

#[derive(Debug)]
struct JoinerRun {
    run_id: RunId,
    state: JoinerState,
    beacons_heard: u32,
    join_attempts: u32,
    /// Joinable networks of the current scan, in beacon order
    candidates: VecDeque<ZigbeeBeacon>,
    phase: JoinPhase,
    joined: Option<NetworkParameters>,
    stop_requested: bool,
    /// Distinguishes join attempts so stale response timeouts are ignored
    join_serial: u32,
    events: mpsc::Sender<ScanEvent>,
}

/// Device-side commissioning state machine
///
/// Searches for a joinable network by walking an ordered matrix of
/// channel-mask tiers (primary, secondary) and link-key tiers (configured
/// key, install code, well-known centralized, well-known distributed), then
/// drives the trust-center link key exchange after a successful join.
pub struct NetworkJoiner<S: ZigbeeStack> {
    stack: Arc<S>,
    queue: Arc<ScanQueue<S>>,
    observer: Arc<dyn CommissioningObserver>,
    config: Arc<RwLock<JoinerConfig>>,
    network_index: u8,
    run: Arc<Mutex<Option<JoinerRun>>>,
}

impl<S: ZigbeeStack> Clone for NetworkJoiner<S> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            queue: self.queue.clone(),
            observer: self.observer.clone(),
            config: self.config.clone(),
            network_index: self.network_index,
            run: self.run.clone(),
        }
    }
}

impl<S: ZigbeeStack> NetworkJoiner<S> {
    pub fn new(
        stack: Arc<S>,
        queue: Arc<ScanQueue<S>>,
        config: JoinerConfig,
        observer: Arc<dyn CommissioningObserver>,
    ) -> Self {
        Self {
            stack,
            queue,
            observer,
            network_index: config.network_index,
            config: Arc::new(RwLock::new(config)),
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// Logical network this joiner commissions
    pub const fn network_index(&self) -> u8 {
        self.network_index
    }

    /// Start a joining run at the highest-priority applicable state
    ///
    /// Fails synchronously when a run is already active, the configuration is
    /// invalid, or the first scan cannot be scheduled.
    pub async fn start(&self) -> CommissioningResult<()> {
        let config = *self.config.read().await;
        config.validate()?;

        let mut guard = self.run.lock().await;
        if guard.is_some() {
            return Err(CommissioningError::OperationInProgress);
        }

        let (events_tx, mut events_rx) = mpsc::channel(SCAN_EVENT_CHANNEL_DEPTH);
        let mut run = JoinerRun {
            run_id: RunId::new(),
            state: JoinerState::Idle,
            beacons_heard: 0,
            join_attempts: 0,
            candidates: VecDeque::new(),
            phase: JoinPhase::Scanning,
            joined: None,
            stop_requested: false,
            join_serial: 0,
            events: events_tx,
        };
        info!(
            run_id = %run.run_id,
            network_index = self.network_index,
            "starting network joining"
        );
        let first = first_scan_state(&config);
        self.enter_scan_state(&mut run, &config, first).await?;
        *guard = Some(run);
        drop(guard);

        let joiner = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                joiner.handle_scan_event(event).await;
            }
        });
        Ok(())
    }

    /// Request a stop, honored at the next state boundary
    ///
    /// With a scan in flight the stop is deferred until the scan-complete
    /// event arrives; the run then reports a cancellation outcome.
    pub async fn stop(&self) {
        let mut guard = self.run.lock().await;
        if let Some(run) = guard.as_mut() {
            info!(run_id = %run.run_id, "stop requested, honoring at next state boundary");
            run.stop_requested = true;
        }
    }

    /// Cancel the run immediately, without waiting for a scan boundary
    ///
    /// Used on emergency stop, when the scan queue has been cleared and no
    /// further scan events will arrive.
    pub async fn abort(&self) {
        let outcome = {
            let mut guard = self.run.lock().await;
            guard.take().map(|mut run| {
                info!(run_id = %run.run_id, "joining aborted");
                close(&mut run);
                self.outcome(&run, JoiningStatus::Cancelled)
            })
        };
        if let Some(outcome) = outcome {
            self.complete(outcome);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Current state of the machine; [`JoinerState::Idle`] between runs
    pub async fn state(&self) -> JoinerState {
        self.run
            .lock()
            .await
            .as_ref()
            .map(|run| run.state)
            .unwrap_or(JoinerState::Idle)
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

    /// Process a deferred stack-status event following a join request
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

    /// Process a trust-center key exchange event
    pub async fn handle_key_update(&self, event: KeyUpdateEvent) {
        let outcome = {
            let mut guard = self.run.lock().await;
            let Some(run) = guard.as_mut() else { return };
            let config = *self.config.read().await;
            let outcome = self.process_key_update(run, &config, event);
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
        run: &mut JoinerRun,
        config: &JoinerConfig,
        event: ScanEvent,
    ) -> Option<JoiningOutcome> {
        match event {
            ScanEvent::Beacon(beacon) => {
                run.beacons_heard += 1;
                if beacon.is_joinable() {
                    debug!(
                        channel = beacon.channel,
                        pan_id = %beacon.pan_id,
                        lqi = beacon.lqi,
                        "joinable network found"
                    );
                    run.candidates.push_back(beacon);
                } else {
                    debug!(
                        channel = beacon.channel,
                        pan_id = %beacon.pan_id,
                        "ignoring closed network"
                    );
                }
                None
            }
            ScanEvent::Energy { .. } => None,
            ScanEvent::Complete { .. } => {
                debug!(
                    run_id = %run.run_id,
                    state = ?run.state,
                    candidates = run.candidates.len(),
                    "scan complete"
                );
                self.try_candidates(run, config).await
            }
            ScanEvent::Failed {
                channel: None,
                status,
                ..
            } => {
                warn!(?status, "scan could not be issued, abandoning run");
                close(run);
                Some(self.outcome(run, JoiningStatus::ScheduleFailed))
            }
            ScanEvent::Failed {
                channel: Some(_),
                status,
                ..
            } => {
                warn!(?status, "scan ended abnormally, joining from beacons heard so far");
                self.try_candidates(run, config).await
            }
        }
    }

    async fn process_stack_status(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
        status: NetworkStatus,
    ) -> Option<JoiningOutcome> {
        match status {
            NetworkStatus::NetworkUp => self.on_network_up(run, config).await,
            NetworkStatus::JoinFailed => {
                if run.state.is_scan_state() && matches!(run.phase, JoinPhase::Joining { .. }) {
                    debug!(run_id = %run.run_id, "join attempt failed, trying next network");
                    self.try_candidates(run, config).await
                } else {
                    None
                }
            }
            NetworkStatus::NetworkDown => self.on_network_down(run, config).await,
            NetworkStatus::FormationFailed => None,
        }
    }

    fn process_key_update(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
        event: KeyUpdateEvent,
    ) -> Option<JoiningOutcome> {
        match (run.state, event) {
            (JoinerState::UpdateTrustCenterLinkKey, KeyUpdateEvent::Updated) => {
                if config.verify_tclk {
                    debug!(run_id = %run.run_id, "trust center link key updated, verifying");
                    advance_to(run, JoinerState::VerifyTrustCenterLinkKey);
                    None
                } else {
                    info!(
                        run_id = %run.run_id,
                        "trust center link key updated, verification disabled"
                    );
                    Some(self.outcome(run, JoiningStatus::Success))
                }
            }
            (JoinerState::UpdateTrustCenterLinkKey, KeyUpdateEvent::Verified) => {
                advance_to(run, JoinerState::VerifyTrustCenterLinkKey);
                Some(self.outcome(run, JoiningStatus::Success))
            }
            (JoinerState::VerifyTrustCenterLinkKey, KeyUpdateEvent::Verified) => {
                info!(run_id = %run.run_id, "trust center link key verified");
                Some(self.outcome(run, JoiningStatus::Success))
            }
            (
                JoinerState::UpdateTrustCenterLinkKey | JoinerState::VerifyTrustCenterLinkKey,
                KeyUpdateEvent::Failed,
            ) => {
                warn!(run_id = %run.run_id, "trust center link key exchange failed");
                Some(self.outcome(run, JoiningStatus::KeyUpdateFailed))
            }
            _ => None,
        }
    }

    async fn on_network_up(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
    ) -> Option<JoiningOutcome> {
        let JoinPhase::Joining { beacon, .. } = run.phase else {
            return None;
        };
        if run.state.is_scan_state() {
            run.joined = Some(join_parameters(&beacon, config));
            info!(
                run_id = %run.run_id,
                pan_id = %beacon.pan_id,
                channel = beacon.channel,
                attempts = run.join_attempts,
                "joined network, requesting trust center link key update"
            );
            advance_to(run, JoinerState::UpdateTrustCenterLinkKey);
        } else if matches!(
            run.state,
            JoinerState::UpdateTrustCenterLinkKey | JoinerState::VerifyTrustCenterLinkKey
        ) {
            debug!(run_id = %run.run_id, "rejoined, restarting key exchange");
        } else {
            return None;
        }
        match self.stack.update_trust_center_link_key().await {
            Ok(()) => None,
            Err(error) => {
                warn!(%error, "trust center link key update rejected");
                Some(self.outcome(run, JoiningStatus::KeyUpdateFailed))
            }
        }
    }

    async fn on_network_down(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
    ) -> Option<JoiningOutcome> {
        let JoinPhase::Joining {
            beacon,
            rejoin_attempts,
        } = run.phase
        else {
            return None;
        };
        if rejoin_attempts >= config.rejoin_retry_budget {
            warn!(run_id = %run.run_id, "rejoin budget exhausted, abandoning run");
            close(run);
            return Some(self.outcome(run, JoiningStatus::Abandoned));
        }
        let attempt = rejoin_attempts + 1;
        run.phase = JoinPhase::Joining {
            beacon,
            rejoin_attempts: attempt,
        };
        run.join_attempts += 1;
        run.join_serial += 1;
        warn!(
            run_id = %run.run_id,
            attempt,
            budget = config.rejoin_retry_budget,
            "network down mid-join, rejoining"
        );
        match self
            .stack
            .join_network(config.node_type, join_parameters(&beacon, config))
            .await
        {
            Ok(()) => {
                if run.state.is_scan_state() {
                    self.arm_join_timeout(run.join_serial, config.join_response_timeout_ms);
                }
                None
            }
            Err(error) => {
                debug!(%error, "rejoin rejected");
                if run.state.is_scan_state() {
                    self.try_candidates(run, config).await
                } else {
                    close(run);
                    Some(self.outcome(run, JoiningStatus::Abandoned))
                }
            }
        }
    }

    /// Start the join-response timer for the given attempt
    fn arm_join_timeout(&self, serial: u32, timeout_ms: u64) {
        let joiner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            joiner.handle_join_timeout(serial).await;
        });
    }

    /// An accepted join produced no stack status in time: give up on that
    /// network and move on
    async fn handle_join_timeout(&self, serial: u32) {
        let outcome = {
            let mut guard = self.run.lock().await;
            let Some(run) = guard.as_mut() else { return };
            if run.join_serial != serial || !run.state.is_scan_state() {
                return;
            }
            let JoinPhase::Joining { beacon, .. } = run.phase else {
                return;
            };
            let config = *self.config.read().await;
            warn!(
                run_id = %run.run_id,
                pan_id = %beacon.pan_id,
                "no join response within timeout, giving up on network"
            );
            let outcome = self.try_candidates(run, &config).await;
            if outcome.is_some() {
                *guard = None;
            }
            outcome
        };
        if let Some(outcome) = outcome {
            self.complete(outcome);
        }
    }

    /// Attempt every remaining candidate of the current scan in beacon order,
    /// then advance to the next state
    async fn try_candidates(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
    ) -> Option<JoiningOutcome> {
        run.phase = JoinPhase::Scanning;
        loop {
            if run.stop_requested {
                info!(run_id = %run.run_id, "joining cancelled");
                close(run);
                return Some(self.outcome(run, JoiningStatus::Cancelled));
            }
            let Some(beacon) = run.candidates.pop_front() else {
                return self.advance_state(run, config).await;
            };
            run.join_attempts += 1;
            match self
                .stack
                .join_network(config.node_type, join_parameters(&beacon, config))
                .await
            {
                Ok(()) => {
                    debug!(
                        pan_id = %beacon.pan_id,
                        channel = beacon.channel,
                        "join request accepted, awaiting stack status"
                    );
                    run.phase = JoinPhase::Joining {
                        beacon,
                        rejoin_attempts: 0,
                    };
                    run.join_serial += 1;
                    self.arm_join_timeout(run.join_serial, config.join_response_timeout_ms);
                    return None;
                }
                Err(error) => {
                    debug!(pan_id = %beacon.pan_id, %error, "join rejected");
                }
            }
        }
    }

    async fn advance_state(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
    ) -> Option<JoiningOutcome> {
        match next_scan_state(run.state, config) {
            Some(next) => match self.enter_scan_state(run, config, next).await {
                Ok(()) => None,
                Err(error) => {
                    warn!(%error, "failed to start next search state, abandoning run");
                    close(run);
                    Some(self.outcome(run, JoiningStatus::ScheduleFailed))
                }
            },
            None => {
                info!(run_id = %run.run_id, "every channel mask and key tier exhausted");
                close(run);
                Some(self.outcome(run, JoiningStatus::NoNetworksJoined))
            }
        }
    }

    /// Load the state's key material and schedule its active scan
    async fn enter_scan_state(
        &self,
        run: &mut JoinerRun,
        config: &JoinerConfig,
        state: JoinerState,
    ) -> CommissioningResult<()> {
        let Some(tier) = state.key_tier() else {
            return Ok(());
        };
        advance_to(run, state);
        run.candidates.clear();
        run.phase = JoinPhase::Scanning;
        let mask = if state.uses_secondary_mask() {
            config.effective_secondary_mask()
        } else {
            config.primary_mask
        };
        self.load_key_material(config, tier).await?;
        self.queue
            .schedule_scan(ScanRequest {
                scan_type: ScanType::Active,
                channel_mask: mask,
                duration: config.scan_duration,
                handler: run.events.clone(),
            })
            .await?;
        info!(
            run_id = %run.run_id,
            state = ?run.state,
            %mask,
            ?tier,
            "scanning for joinable networks"
        );
        Ok(())
    }

    /// Stage the tier's key material in the security subsystem
    async fn load_key_material(
        &self,
        config: &JoinerConfig,
        tier: KeyTier,
    ) -> CommissioningResult<()> {
        let mode = if tier == KeyTier::Distributed {
            SecurityMode::Distributed
        } else {
            SecurityMode::Centralized
        };
        let preconfigured_key = match tier {
            KeyTier::Configured => config.configured_key,
            KeyTier::InstallCode => config.install_code_key,
            KeyTier::AllWellKnown => config.configured_key,
            KeyTier::Centralized | KeyTier::Distributed => None,
        };
        self.stack
            .set_initial_security_state(InitialSecurityState {
                mode,
                preconfigured_key,
            })
            .await?;
        match tier {
            KeyTier::Configured => {}
            KeyTier::InstallCode => {
                if let Some(key) = config.install_code_key {
                    self.stack.import_transient_key(Eui64::WILDCARD, key).await?;
                }
            }
            KeyTier::Centralized => {
                self.stack
                    .import_transient_key(Eui64::WILDCARD, CENTRALIZED_SECURITY_LINK_KEY)
                    .await?;
            }
            KeyTier::Distributed => {
                self.stack
                    .import_transient_key(Eui64::WILDCARD, DISTRIBUTED_SECURITY_LINK_KEY)
                    .await?;
            }
            KeyTier::AllWellKnown => {
                if let Some(key) = config.install_code_key {
                    self.stack.import_transient_key(Eui64::WILDCARD, key).await?;
                }
                self.stack
                    .import_transient_key(Eui64::WILDCARD, CENTRALIZED_SECURITY_LINK_KEY)
                    .await?;
                self.stack
                    .import_transient_key(Eui64::WILDCARD, DISTRIBUTED_SECURITY_LINK_KEY)
                    .await?;
            }
        }
        Ok(())
    }

    fn outcome(&self, run: &JoinerRun, status: JoiningStatus) -> JoiningOutcome {
        JoiningOutcome {
            run_id: run.run_id,
            status,
            network: run.joined,
            beacons_heard: run.beacons_heard,
            join_attempts: run.join_attempts,
            final_state: run.state,
        }
    }

    fn complete(&self, outcome: JoiningOutcome) {
        info!(
            run_id = %outcome.run_id,
            status = ?outcome.status,
            beacons = outcome.beacons_heard,
            attempts = outcome.join_attempts,
            final_state = ?outcome.final_state,
            "joining run complete"
        );
        self.observer.joining_complete(&outcome);
    }
}

fn join_parameters(beacon: &ZigbeeBeacon, config: &JoinerConfig) -> NetworkParameters {
    NetworkParameters {
        channel: beacon.channel,
        pan_id: beacon.pan_id,
        extended_pan_id: beacon.extended_pan_id,
        tx_power: config.tx_power,
    }
}

/// States only ever advance in priority within one run
fn advance_to(run: &mut JoinerRun, next: JoinerState) {
    debug_assert!(
        next.priority() > run.state.priority(),
        "joiner state may only advance: {:?} -> {:?}",
        run.state,
        next
    );
    run.state = next;
}

/// Close the search: failure and cancellation outcomes report from
/// `ScanFinished`, while runs that already reached the key exchange keep
/// their final state
fn close(run: &mut JoinerRun) {
    if run.state.priority() < JoinerState::ScanFinished.priority() {
        run.state = JoinerState::ScanFinished;
    }
}

fn first_scan_state(config: &JoinerConfig) -> JoinerState {
    if config.configured_key.is_some() {
        JoinerState::ScanPrimaryConfiguredKey
    } else if config.try_all_keys {
        JoinerState::ScanPrimaryAllKeys
    } else if config.install_code_key.is_some() {
        JoinerState::ScanPrimaryInstallCode
    } else {
        JoinerState::ScanPrimaryCentralizedKey
    }
}

fn secondary_start(config: &JoinerConfig) -> JoinerState {
    if config.configured_key.is_some() {
        JoinerState::ScanSecondaryConfiguredKey
    } else if config.try_all_keys {
        JoinerState::ScanSecondaryAllKeys
    } else if config.install_code_key.is_some() {
        JoinerState::ScanSecondaryInstallCode
    } else {
        JoinerState::ScanSecondaryCentralizedKey
    }
}

fn next_scan_state(current: JoinerState, config: &JoinerConfig) -> Option<JoinerState> {
    let next = match current {
        JoinerState::ScanPrimaryConfiguredKey => {
            if config.try_all_keys {
                JoinerState::ScanPrimaryAllKeys
            } else if config.install_code_key.is_some() {
                JoinerState::ScanPrimaryInstallCode
            } else {
                JoinerState::ScanPrimaryCentralizedKey
            }
        }
        JoinerState::ScanPrimaryAllKeys => secondary_start(config),
        JoinerState::ScanPrimaryInstallCode => JoinerState::ScanPrimaryCentralizedKey,
        JoinerState::ScanPrimaryCentralizedKey => JoinerState::ScanPrimaryDistributedKey,
        JoinerState::ScanPrimaryDistributedKey => secondary_start(config),
        JoinerState::ScanSecondaryConfiguredKey => {
            if config.try_all_keys {
                JoinerState::ScanSecondaryAllKeys
            } else if config.install_code_key.is_some() {
                JoinerState::ScanSecondaryInstallCode
            } else {
                JoinerState::ScanSecondaryCentralizedKey
            }
        }
        JoinerState::ScanSecondaryAllKeys => return None,
        JoinerState::ScanSecondaryInstallCode => JoinerState::ScanSecondaryCentralizedKey,
        JoinerState::ScanSecondaryCentralizedKey => JoinerState::ScanSecondaryDistributedKey,
        JoinerState::ScanSecondaryDistributedKey => return None,
        _ => return None,
    };
    Some(next)
}
