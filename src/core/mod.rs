//! Core commissioning engine module

pub mod channel_mask;
pub mod error;
pub mod former;
pub mod joiner;
pub mod observer;
pub mod scan_queue;
pub mod service;
pub mod types;
