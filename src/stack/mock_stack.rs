//! Mock Zigbee stack for testing

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::channel_mask::ChannelMask;
use crate::core::error::{StackError, StackResult};
use crate::core::types::{
    Eui64, InitialSecurityState, KeyData, NetworkParameters, NodeType, PanId, ScanDuration,
    ScanType,
};
use crate::stack::ZigbeeStack;

/// One recorded `begin_scan` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCall {
    pub scan_type: ScanType,
    pub channel_mask: ChannelMask,
    pub duration: ScanDuration,
}

/// One recorded `join_network` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinCall {
    pub node_type: NodeType,
    pub parameters: NetworkParameters,
}

/// Internal state for the mock stack
#[derive(Debug, Default)]
struct MockState {
    scan_calls: Vec<ScanCall>,
    aborted_scans: u32,
    form_calls: Vec<NetworkParameters>,
    join_calls: Vec<JoinCall>,
    security_states: Vec<InitialSecurityState>,
    transient_keys: Vec<(Eui64, KeyData)>,
    key_update_requests: u32,
    scan_error: Option<StackError>,
    form_rejected_channels: ChannelMask,
    join_rejected_pans: Vec<PanId>,
    fail_key_update: bool,
}

/// Mock Zigbee stack for testing
///
/// Records every command and returns scripted immediate statuses; tests drive
/// asynchronous results by feeding stack events into the engine directly.
#[derive(Debug, Clone, Default)]
pub struct MockZigbeeStack {
    inner: Arc<Mutex<MockState>>,
}

impl MockZigbeeStack {
    /// Create a mock stack that accepts every command
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure `begin_scan` to return the given error while set
    pub async fn set_scan_error(&self, error: Option<StackError>) {
        self.inner.lock().await.scan_error = error;
    }

    /// Configure `form_network` to reject the given channels
    pub async fn reject_form_on(&self, channels: ChannelMask) {
        self.inner.lock().await.form_rejected_channels = channels;
    }

    /// Configure `join_network` to reject the given PAN
    pub async fn reject_join_of(&self, pan_id: PanId) {
        self.inner.lock().await.join_rejected_pans.push(pan_id);
    }

    /// Configure `update_trust_center_link_key` to fail
    pub async fn set_key_update_failure(&self, should_fail: bool) {
        self.inner.lock().await.fail_key_update = should_fail;
    }

    pub async fn scan_calls(&self) -> Vec<ScanCall> {
        self.inner.lock().await.scan_calls.clone()
    }

    pub async fn abort_count(&self) -> u32 {
        self.inner.lock().await.aborted_scans
    }

    pub async fn form_calls(&self) -> Vec<NetworkParameters> {
        self.inner.lock().await.form_calls.clone()
    }

    pub async fn join_calls(&self) -> Vec<JoinCall> {
        self.inner.lock().await.join_calls.clone()
    }

    pub async fn security_states(&self) -> Vec<InitialSecurityState> {
        self.inner.lock().await.security_states.clone()
    }

    pub async fn transient_keys(&self) -> Vec<(Eui64, KeyData)> {
        self.inner.lock().await.transient_keys.clone()
    }

    pub async fn key_update_requests(&self) -> u32 {
        self.inner.lock().await.key_update_requests
    }
}

impl ZigbeeStack for MockZigbeeStack {
    async fn begin_scan(
        &self,
        scan_type: ScanType,
        channel_mask: ChannelMask,
        duration: ScanDuration,
    ) -> StackResult<()> {
        let mut state = self.inner.lock().await;
        state.scan_calls.push(ScanCall {
            scan_type,
            channel_mask,
            duration,
        });
        match &state.scan_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn abort_scan(&self) -> StackResult<()> {
        self.inner.lock().await.aborted_scans += 1;
        Ok(())
    }

    async fn form_network(&self, parameters: NetworkParameters) -> StackResult<()> {
        let mut state = self.inner.lock().await;
        state.form_calls.push(parameters);
        if state.form_rejected_channels.contains(parameters.channel) {
            Err(StackError::Rejected(format!(
                "channel {} unavailable",
                parameters.channel
            )))
        } else {
            Ok(())
        }
    }

    async fn join_network(
        &self,
        node_type: NodeType,
        parameters: NetworkParameters,
    ) -> StackResult<()> {
        let mut state = self.inner.lock().await;
        state.join_calls.push(JoinCall {
            node_type,
            parameters,
        });
        if state.join_rejected_pans.contains(&parameters.pan_id) {
            Err(StackError::Rejected(format!(
                "pan {} unavailable",
                parameters.pan_id
            )))
        } else {
            Ok(())
        }
    }

    async fn set_initial_security_state(&self, state: InitialSecurityState) -> StackResult<()> {
        self.inner.lock().await.security_states.push(state);
        Ok(())
    }

    async fn import_transient_key(&self, partner: Eui64, key: KeyData) -> StackResult<()> {
        self.inner.lock().await.transient_keys.push((partner, key));
        Ok(())
    }

    async fn update_trust_center_link_key(&self) -> StackResult<()> {
        let mut state = self.inner.lock().await;
        state.key_update_requests += 1;
        if state.fail_key_update {
            Err(StackError::Security("key update refused".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExtendedPanId;

    fn parameters(channel: u8) -> NetworkParameters {
        NetworkParameters {
            channel,
            pan_id: PanId::new(0x1a2b),
            extended_pan_id: ExtendedPanId::new([1, 2, 3, 4, 5, 6, 7, 8]),
            tx_power: 3,
        }
    }

    #[tokio::test]
    async fn test_mock_records_scans() {
        let stack = MockZigbeeStack::new();
        stack
            .begin_scan(
                ScanType::Active,
                ChannelMask::single(11).unwrap(),
                ScanDuration::new(3).unwrap(),
            )
            .await
            .unwrap();

        let calls = stack.scan_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].scan_type, ScanType::Active);
    }

    #[tokio::test]
    async fn test_mock_scan_error() {
        let stack = MockZigbeeStack::new();
        stack.set_scan_error(Some(StackError::NetworkBusy)).await;

        let result = stack
            .begin_scan(
                ScanType::Energy,
                ChannelMask::ALL,
                ScanDuration::new(4).unwrap(),
            )
            .await;
        assert_eq!(result, Err(StackError::NetworkBusy));
    }

    #[tokio::test]
    async fn test_mock_form_rejection() {
        let stack = MockZigbeeStack::new();
        stack
            .reject_form_on(ChannelMask::single(15).unwrap())
            .await;

        assert!(stack.form_network(parameters(15)).await.is_err());
        assert!(stack.form_network(parameters(20)).await.is_ok());
        assert_eq!(stack.form_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_join_rejection() {
        let stack = MockZigbeeStack::new();
        stack.reject_join_of(PanId::new(0x1a2b)).await;

        let result = stack
            .join_network(NodeType::Router, parameters(11))
            .await;
        assert!(result.is_err());
        assert_eq!(stack.join_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_key_operations() {
        let stack = MockZigbeeStack::new();
        stack
            .import_transient_key(
                Eui64::WILDCARD,
                crate::core::types::CENTRALIZED_SECURITY_LINK_KEY,
            )
            .await
            .unwrap();
        stack.update_trust_center_link_key().await.unwrap();

        assert_eq!(stack.transient_keys().await.len(), 1);
        assert_eq!(stack.key_update_requests().await, 1);

        stack.set_key_update_failure(true).await;
        assert!(stack.update_trust_center_link_key().await.is_err());
    }
}
