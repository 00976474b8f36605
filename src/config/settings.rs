//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::core::{
    channel_mask::ChannelMask,
    error::{ConfigError, ConfigResult},
    types::{
        ExtendedPanId, KeyData, MAX_SCAN_DURATION, NodeType, PanId, ScanDuration, SecurityMode,
    },
};

/// Default primary channel mask: the BDB preferred channels
/// 11, 14, 15, 19, 20, 24 and 25
pub const DEFAULT_PRIMARY_MASK: ChannelMask = ChannelMask::from_bits_truncate(0x0318_c800);

/// Network-former configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormerConfig {
    pub primary_mask: ChannelMask,
    /// Secondary mask; complement of the primary when unset
    pub secondary_mask: Option<ChannelMask>,
    pub scan_duration: ScanDuration,
    /// Beacon count above which a channel is disqualified
    pub beacon_threshold: u16,
    /// Corrected RSSI in dBm above which a channel is disqualified
    pub rssi_threshold: i8,
    /// Correction added to raw energy readings (radio calibration)
    pub rssi_correction: i8,
    /// Minimum number of candidate channels kept before eviction becomes
    /// comparative
    pub channels_to_consider: u32,
    /// Radio transmit power in dBm for the formed network
    pub tx_power: i8,
    /// Fixed PAN id; chosen at random per run when unset
    pub pan_id: Option<PanId>,
    /// Fixed extended PAN id; chosen at random per run when unset
    pub extended_pan_id: Option<ExtendedPanId>,
    pub security_mode: SecurityMode,
}

impl Default for FormerConfig {
    fn default() -> Self {
        Self {
            primary_mask: DEFAULT_PRIMARY_MASK,
            secondary_mask: None,
            scan_duration: ScanDuration::clamped(4),
            beacon_threshold: 20,
            rssi_threshold: -48,
            rssi_correction: 0,
            channels_to_consider: 8,
            tx_power: 3,
            pan_id: None,
            extended_pan_id: None,
            security_mode: SecurityMode::Centralized,
        }
    }
}

impl FormerConfig {
    /// Reject invalid masks, budgets and durations synchronously
    pub fn validate(&self) -> ConfigResult<()> {
        validate_masks(self.primary_mask, self.secondary_mask)?;
        if self.channels_to_consider == 0 {
            return Err(ConfigError::ZeroChannelBudget);
        }
        if self.scan_duration.exponent() > MAX_SCAN_DURATION {
            return Err(ConfigError::InvalidScanDuration(self.scan_duration.exponent()));
        }
        Ok(())
    }

    /// Effective secondary mask: the configured one, or the complement of the
    /// primary within the legal channel range
    pub fn effective_secondary_mask(&self) -> ChannelMask {
        self.secondary_mask
            .unwrap_or_else(|| self.primary_mask.complement())
    }
}

/// Network-joiner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinerConfig {
    pub primary_mask: ChannelMask,
    /// Secondary mask; complement of the primary when unset
    pub secondary_mask: Option<ChannelMask>,
    pub scan_duration: ScanDuration,
    pub node_type: NodeType,
    /// Logical network this joiner commissions (multi-PAN hardware)
    pub network_index: u8,
    /// Rejoin attempts tolerated after a mid-join network drop
    pub rejoin_retry_budget: u8,
    /// Milliseconds to wait for a stack status after an accepted join before
    /// giving up on that network
    pub join_response_timeout_ms: u64,
    /// Application-preloaded link key; enables the configured-key states
    pub configured_key: Option<KeyData>,
    /// Install-code-derived link key; enables the install-code states
    pub install_code_key: Option<KeyData>,
    /// Stage every well-known key tier in a single scan per mask
    pub try_all_keys: bool,
    /// Verify the trust-center link key exchange after updating it
    pub verify_tclk: bool,
    /// Radio transmit power in dBm while joining
    pub tx_power: i8,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            primary_mask: DEFAULT_PRIMARY_MASK,
            secondary_mask: None,
            scan_duration: ScanDuration::clamped(3),
            node_type: NodeType::Router,
            network_index: 0,
            rejoin_retry_budget: 2,
            join_response_timeout_ms: 2_000,
            configured_key: None,
            install_code_key: None,
            try_all_keys: false,
            verify_tclk: true,
            tx_power: 3,
        }
    }
}

impl JoinerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        validate_masks(self.primary_mask, self.secondary_mask)?;
        if self.scan_duration.exponent() > MAX_SCAN_DURATION {
            return Err(ConfigError::InvalidScanDuration(self.scan_duration.exponent()));
        }
        Ok(())
    }

    /// Effective secondary mask: the configured one, or the complement of the
    /// primary within the legal channel range
    pub fn effective_secondary_mask(&self) -> ChannelMask {
        self.secondary_mask
            .unwrap_or_else(|| self.primary_mask.complement())
    }
}

/// Top-level engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Scan queue slots shared by every engine component
    pub scan_queue_capacity: usize,
    pub former: FormerConfig,
    pub joiner: JoinerConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_queue_capacity: 4,
            former: FormerConfig::default(),
            joiner: JoinerConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scan_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        self.former.validate()?;
        self.joiner.validate()?;
        Ok(())
    }
}

// Masks deserialized from raw bits bypass the checked constructors, so
// revalidate the bit range here as well.
fn validate_masks(primary: ChannelMask, secondary: Option<ChannelMask>) -> ConfigResult<()> {
    ChannelMask::from_bits(primary.bits())?;
    if primary.is_empty() {
        return Err(ConfigError::EmptyMask);
    }
    if let Some(mask) = secondary {
        ChannelMask::from_bits(mask.bits())?;
        if mask.is_empty() {
            return Err(ConfigError::EmptyMask);
        }
    }
    Ok(())
}
