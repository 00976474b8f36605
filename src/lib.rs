//! Zigbee Commissioning Engine
//!
//! Decides which radio channel and security key material a device uses to
//! form a new PAN or join an existing one:
//! - a bounded scan queue serializing all consumers onto the single radio
//! - a network former scoring channels by beacon count and peak energy
//! - a network joiner walking an ordered matrix of channel-mask and key tiers
//!
//! The 802.15.4/Zigbee protocol stack itself sits behind the
//! [`stack::ZigbeeStack`] trait; its asynchronous results enter the engine as
//! [`core::types::StackEvent`]s through the facade's event pump.

pub mod config;
pub mod core;
pub mod stack;

pub use crate::core::{
    channel_mask::ChannelMask,
    error::{CommissioningError, ConfigError, StackError},
    observer::CommissioningObserver,
    service::CommissioningService,
    types::{
        FormationOutcome, FormationStatus, JoinerState, JoiningOutcome, JoiningStatus, StackEvent,
    },
};
