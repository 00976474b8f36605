//! External Zigbee stack trait definition

use trait_variant::make;

use crate::core::channel_mask::ChannelMask;
use crate::core::error::StackResult;
use crate::core::types::{
    Eui64, InitialSecurityState, KeyData, NetworkParameters, NodeType, ScanDuration, ScanType,
};

/// Abstraction over the external 802.15.4/Zigbee protocol stack
///
/// The engine only talks to the stack through this opaque command interface.
/// Every method returns the stack's immediate status; asynchronous results
/// (scan readings, beacons, network up/down, key-exchange outcomes) arrive
/// later as [`crate::core::types::StackEvent`]s fed into the engine's event
/// pump. This trait enables testing through mock implementations.
#[make(Send)]
pub trait ZigbeeStack: Sync + 'static {
    /// Start a hardware scan over the given channels
    ///
    /// Results are delivered as scan events; exactly one scan may be
    /// outstanding at a time.
    async fn begin_scan(
        &self,
        scan_type: ScanType,
        channel_mask: ChannelMask,
        duration: ScanDuration,
    ) -> StackResult<()>;

    /// Abort the scan in progress, if any
    async fn abort_scan(&self) -> StackResult<()>;

    /// Form a new network with the given parameters
    ///
    /// Acceptance is followed by a network-up or failure stack-status event.
    async fn form_network(&self, parameters: NetworkParameters) -> StackResult<()>;

    /// Attempt to join the described network
    ///
    /// Acceptance is followed by a network-up, join-failed or network-down
    /// stack-status event.
    async fn join_network(
        &self,
        node_type: NodeType,
        parameters: NetworkParameters,
    ) -> StackResult<()>;

    /// Load initial security material ahead of forming or joining
    async fn set_initial_security_state(&self, state: InitialSecurityState) -> StackResult<()>;

    /// Stage a transient link key for the given partner
    ///
    /// [`Eui64::WILDCARD`] stages the key for any partner.
    async fn import_transient_key(&self, partner: Eui64, key: KeyData) -> StackResult<()>;

    /// Request a fresh trust-center link key after a successful join
    ///
    /// The exchange outcome arrives as a key-update event.
    async fn update_trust_center_link_key(&self) -> StackResult<()>;
}
