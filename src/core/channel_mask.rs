//! Fixed-width bitmask over the 802.15.4 2.4 GHz channel range

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{ConfigError, ConfigResult};

/// Lowest 2.4 GHz 802.15.4 channel
pub const CHANNEL_MIN: u8 = 11;
/// Highest 2.4 GHz 802.15.4 channel
pub const CHANNEL_MAX: u8 = 26;
/// Number of channels in the legal range
pub const CHANNEL_COUNT: usize = 16;

/// Whether `channel` lies in the legal 2.4 GHz range
pub const fn is_valid_channel(channel: u8) -> bool {
    channel >= CHANNEL_MIN && channel <= CHANNEL_MAX
}

/// Position of `channel` in per-channel tables, if it is a legal channel
pub(crate) const fn index_of(channel: u8) -> Option<usize> {
    if is_valid_channel(channel) {
        Some((channel - CHANNEL_MIN) as usize)
    } else {
        None
    }
}

/// Channel number stored at table position `index`
pub(crate) const fn channel_at(index: usize) -> u8 {
    CHANNEL_MIN + index as u8
}

// Callers check the range before shifting.
const fn bit(channel: u8) -> u32 {
    1 << channel
}

/// Set of 802.15.4 channels, one bit per channel number
///
/// Bit `n` corresponds to channel `n`; only bits 11..=26 are ever set.
#[derive(Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMask(u32);

impl ChannelMask {
    /// Mask with no channels
    pub const EMPTY: ChannelMask = ChannelMask(0);
    /// Mask covering the entire legal channel range
    pub const ALL: ChannelMask = ChannelMask(0x07ff_f800);

    /// Build a mask from raw bits, rejecting bits outside the channel range
    pub fn from_bits(bits: u32) -> ConfigResult<Self> {
        if bits & !Self::ALL.0 != 0 {
            return Err(ConfigError::InvalidMask(bits));
        }
        Ok(Self(bits))
    }

    /// Build a mask from raw bits, discarding bits outside the channel range
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Build a mask holding a single channel
    pub fn single(channel: u8) -> ConfigResult<Self> {
        if !is_valid_channel(channel) {
            return Err(ConfigError::InvalidChannel(channel));
        }
        Ok(Self(bit(channel)))
    }

    /// Raw bit representation
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Add a channel to the set; out-of-range channels are ignored
    pub fn insert(&mut self, channel: u8) {
        if is_valid_channel(channel) {
            self.0 |= bit(channel);
        }
    }

    /// Remove a channel from the set
    pub fn remove(&mut self, channel: u8) {
        if is_valid_channel(channel) {
            self.0 &= !bit(channel);
        }
    }

    /// Whether the set contains `channel`
    pub fn contains(self, channel: u8) -> bool {
        is_valid_channel(channel) && self.0 & bit(channel) != 0
    }

    /// Channels present in either set
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Channels present in both sets
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Channels of the legal range not in this set
    pub const fn complement(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of channels in the set
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest channel in the set, if any
    pub fn first(self) -> Option<u8> {
        self.iter().next()
    }

    /// Channels in ascending order
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (CHANNEL_MIN..=CHANNEL_MAX).filter(move |&channel| self.contains(channel))
    }

    /// Channels in ascending order starting at `start`, wrapping around the
    /// legal range
    pub fn iter_from(self, start: u8) -> impl Iterator<Item = u8> {
        let origin = if is_valid_channel(start) { start } else { CHANNEL_MIN };
        (0..CHANNEL_COUNT as u8)
            .map(move |step| {
                CHANNEL_MIN + (origin - CHANNEL_MIN + step) % CHANNEL_COUNT as u8
            })
            .filter(move |&channel| self.contains(channel))
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelMask({:#010x})", self.0)
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits_rejects_out_of_range() {
        assert!(ChannelMask::from_bits(0x0000_0001).is_err());
        assert!(ChannelMask::from_bits(0x0800_0000).is_err());
        assert!(ChannelMask::from_bits(0x07ff_f800).is_ok());
    }

    #[test]
    fn test_insert_remove_contains() {
        let mut mask = ChannelMask::EMPTY;
        mask.insert(11);
        mask.insert(26);
        mask.insert(5); // out of range, ignored
        assert!(mask.contains(11));
        assert!(mask.contains(26));
        assert!(!mask.contains(5));
        assert_eq!(mask.count(), 2);

        mask.remove(11);
        assert!(!mask.contains(11));
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn test_complement_partitions_legal_range() {
        let mask = ChannelMask::from_bits(0x0318_c800).unwrap();
        let complement = mask.complement();
        assert_eq!(mask.union(complement), ChannelMask::ALL);
        assert_eq!(mask.intersection(complement), ChannelMask::EMPTY);
    }

    #[test]
    fn test_iter_ascending() {
        let mask = ChannelMask::single(15)
            .unwrap()
            .union(ChannelMask::single(11).unwrap())
            .union(ChannelMask::single(20).unwrap());
        let channels: Vec<u8> = mask.iter().collect();
        assert_eq!(channels, vec![11, 15, 20]);
    }

    #[test]
    fn test_iter_from_wraps_around() {
        let mask = ChannelMask::single(12)
            .unwrap()
            .union(ChannelMask::single(20).unwrap())
            .union(ChannelMask::single(25).unwrap());
        let channels: Vec<u8> = mask.iter_from(20).collect();
        assert_eq!(channels, vec![20, 25, 12]);
    }

    #[test]
    fn test_single_rejects_invalid_channel() {
        assert!(ChannelMask::single(10).is_err());
        assert!(ChannelMask::single(27).is_err());
        assert!(ChannelMask::single(11).is_ok());
    }
}
