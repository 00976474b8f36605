//! Domain types for Zigbee commissioning

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{ConfigError, ConfigResult};

/// Stack profile advertised by Zigbee PRO networks
pub const STACK_PROFILE_PRO: u8 = 2;

/// Largest legal 802.15.4 scan duration exponent
pub const MAX_SCAN_DURATION: u8 = 14;

/// 802.15.4 scan flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    /// Per-channel RF energy measurement
    Energy,
    /// Beacon request / PAN discovery
    Active,
}

/// 802.15.4 scan duration exponent
///
/// Scan time per channel is proportional to `2^n + 1` base superframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanDuration(u8);

impl ScanDuration {
    pub fn new(exponent: u8) -> ConfigResult<Self> {
        if exponent > MAX_SCAN_DURATION {
            return Err(ConfigError::InvalidScanDuration(exponent));
        }
        Ok(Self(exponent))
    }

    /// Build a duration, clamping oversized exponents to the legal maximum
    pub const fn clamped(exponent: u8) -> Self {
        if exponent > MAX_SCAN_DURATION {
            Self(MAX_SCAN_DURATION)
        } else {
            Self(exponent)
        }
    }

    pub const fn exponent(self) -> u8 {
        self.0
    }
}

/// 802.15.4 PAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanId(u16);

impl PanId {
    /// Reserved broadcast PAN id, never assigned to a network
    pub const BROADCAST: PanId = PanId(0xffff);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Random PAN id outside the reserved broadcast value
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen_range(0x0000..0xffff))
    }
}

impl fmt::Display for PanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// 64-bit extended PAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPanId([u8; 8]);

impl ExtendedPanId {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> [u8; 8] {
        self.0
    }

    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ExtendedPanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// IEEE 64-bit device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Eui64([u8; 8]);

impl Eui64 {
    /// Wildcard address matching any joining device
    pub const WILDCARD: Eui64 = Eui64([0xff; 8]);

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> [u8; 8] {
        self.0
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 128-bit link or network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyData([u8; 16]);

impl KeyData {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> [u8; 16] {
        self.0
    }
}

/// Well-known centralized-security link key ("ZigbeeAlliance09")
pub const CENTRALIZED_SECURITY_LINK_KEY: KeyData = KeyData::new([
    0x5a, 0x69, 0x67, 0x42, 0x65, 0x65, 0x41, 0x6c, 0x6c, 0x69, 0x61, 0x6e, 0x63, 0x65, 0x30,
    0x39,
]);

/// Well-known distributed-security global link key
pub const DISTRIBUTED_SECURITY_LINK_KEY: KeyData = KeyData::new([
    0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde,
    0xdf,
]);

/// Beacon heard during an active scan, describing a candidate PAN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZigbeeBeacon {
    pub channel: u8,
    pub pan_id: PanId,
    pub extended_pan_id: ExtendedPanId,
    /// Whether the network currently accepts joiners
    pub permit_joining: bool,
    pub stack_profile: u8,
    pub nwk_update_id: u8,
    /// Link quality of the received beacon
    pub lqi: u8,
    /// Signal strength of the received beacon in dBm
    pub rssi: i8,
}

impl ZigbeeBeacon {
    /// Whether this beacon advertises a network we could join
    pub fn is_joinable(&self) -> bool {
        self.permit_joining && self.stack_profile == STACK_PROFILE_PRO
    }
}

/// Parameters of a formed or joined network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub channel: u8,
    pub pan_id: PanId,
    pub extended_pan_id: ExtendedPanId,
    /// Radio transmit power in dBm
    pub tx_power: i8,
}

/// Role a device assumes when joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Router,
    EndDevice,
    SleepyEndDevice,
}

/// Security model of the network being formed or joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Trust-center based network
    Centralized,
    /// Router-formed network without a trust center
    Distributed,
}

/// Security material loaded ahead of forming or joining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialSecurityState {
    pub mode: SecurityMode,
    pub preconfigured_key: Option<KeyData>,
}

/// Identifier attached to one commissioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion status codes reported by the radio for a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Success,
    Aborted,
    Busy,
    Failed,
}

/// Raw scan callback shapes produced by the radio MAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioScanEvent {
    EnergyReading { channel: u8, rssi: i8 },
    NetworkFound { beacon: ZigbeeBeacon },
    ScanComplete { channel: u8, status: ScanStatus },
}

/// Deferred stack-status events following form/join requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    NetworkUp,
    NetworkDown,
    JoinFailed,
    FormationFailed,
}

/// Outcome of a trust-center link key exchange step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdateEvent {
    Updated,
    Verified,
    Failed,
}

/// Every asynchronous event the external stack delivers to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    Scan(RadioScanEvent),
    Status(NetworkStatus),
    KeyUpdate(KeyUpdateEvent),
}

/// Scan result delivered to the owning handler, tagged by the scan queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Energy {
        channel: u8,
        rssi: i8,
    },
    Beacon(ZigbeeBeacon),
    Complete {
        scan_type: ScanType,
        channel: u8,
    },
    /// Scan ended abnormally; `channel` is absent when the scan could not be
    /// issued at all
    Failed {
        scan_type: ScanType,
        channel: Option<u8>,
        status: ScanStatus,
    },
}

/// Key material tier a joiner scan state preloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTier {
    /// Application-preloaded link key
    Configured,
    /// Every well-known tier staged at once
    AllWellKnown,
    /// Install-code-derived link key
    InstallCode,
    /// Well-known centralized link key
    Centralized,
    /// Well-known distributed global key
    Distributed,
}

/// Joiner state machine states, in strictly increasing priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinerState {
    Idle,
    ScanPrimaryConfiguredKey,
    ScanPrimaryAllKeys,
    ScanPrimaryInstallCode,
    ScanPrimaryCentralizedKey,
    ScanPrimaryDistributedKey,
    ScanSecondaryConfiguredKey,
    ScanSecondaryAllKeys,
    ScanSecondaryInstallCode,
    ScanSecondaryCentralizedKey,
    ScanSecondaryDistributedKey,
    ScanFinished,
    UpdateTrustCenterLinkKey,
    VerifyTrustCenterLinkKey,
}

impl JoinerState {
    /// Explicit ordering used to enforce monotonic advance within a run
    pub const fn priority(self) -> u8 {
        match self {
            JoinerState::Idle => 0,
            JoinerState::ScanPrimaryConfiguredKey => 1,
            JoinerState::ScanPrimaryAllKeys => 2,
            JoinerState::ScanPrimaryInstallCode => 3,
            JoinerState::ScanPrimaryCentralizedKey => 4,
            JoinerState::ScanPrimaryDistributedKey => 5,
            JoinerState::ScanSecondaryConfiguredKey => 6,
            JoinerState::ScanSecondaryAllKeys => 7,
            JoinerState::ScanSecondaryInstallCode => 8,
            JoinerState::ScanSecondaryCentralizedKey => 9,
            JoinerState::ScanSecondaryDistributedKey => 10,
            JoinerState::ScanFinished => 11,
            JoinerState::UpdateTrustCenterLinkKey => 12,
            JoinerState::VerifyTrustCenterLinkKey => 13,
        }
    }

    /// Whether this state scans for networks
    pub const fn is_scan_state(self) -> bool {
        self.key_tier().is_some()
    }

    /// Whether this state scans the secondary channel mask
    pub const fn uses_secondary_mask(self) -> bool {
        matches!(
            self,
            JoinerState::ScanSecondaryConfiguredKey
                | JoinerState::ScanSecondaryAllKeys
                | JoinerState::ScanSecondaryInstallCode
                | JoinerState::ScanSecondaryCentralizedKey
                | JoinerState::ScanSecondaryDistributedKey
        )
    }

    /// Key material this state preloads before scanning
    pub const fn key_tier(self) -> Option<KeyTier> {
        match self {
            JoinerState::ScanPrimaryConfiguredKey | JoinerState::ScanSecondaryConfiguredKey => {
                Some(KeyTier::Configured)
            }
            JoinerState::ScanPrimaryAllKeys | JoinerState::ScanSecondaryAllKeys => {
                Some(KeyTier::AllWellKnown)
            }
            JoinerState::ScanPrimaryInstallCode | JoinerState::ScanSecondaryInstallCode => {
                Some(KeyTier::InstallCode)
            }
            JoinerState::ScanPrimaryCentralizedKey
            | JoinerState::ScanSecondaryCentralizedKey => Some(KeyTier::Centralized),
            JoinerState::ScanPrimaryDistributedKey
            | JoinerState::ScanSecondaryDistributedKey => Some(KeyTier::Distributed),
            _ => None,
        }
    }
}

/// Definitive status of a formation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormationStatus {
    Success,
    /// Every mask, including the least-worst fallback, was exhausted
    Exhausted,
    /// A scan could not be scheduled
    ScheduleFailed,
    Stopped,
}

/// Result of one formation run, delivered exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormationOutcome {
    pub run_id: RunId,
    pub status: FormationStatus,
    pub parameters: Option<NetworkParameters>,
    pub used_secondary_mask: bool,
}

/// Definitive status of a joining run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoiningStatus {
    Success,
    /// Joined, but the trust-center key exchange failed
    KeyUpdateFailed,
    /// Every channel-mask and key tier was exhausted without a join
    NoNetworksJoined,
    /// The network dropped mid-join and the rejoin budget ran out
    Abandoned,
    /// A scan could not be scheduled
    ScheduleFailed,
    Cancelled,
}

impl JoiningStatus {
    /// Whether the device is on a network despite the reported status
    pub const fn joined(self) -> bool {
        matches!(self, JoiningStatus::Success | JoiningStatus::KeyUpdateFailed)
    }
}

/// Result of one joining run, delivered exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoiningOutcome {
    pub run_id: RunId,
    pub status: JoiningStatus,
    pub network: Option<NetworkParameters>,
    /// Beacons heard across every state of the run
    pub beacons_heard: u32,
    /// Join attempts made across every state of the run
    pub join_attempts: u32,
    /// State the machine was in when the run ended
    pub final_state: JoinerState,
}
