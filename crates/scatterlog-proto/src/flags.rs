//! Packet header flags.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in byte 1 of the packet header.
    ///
    /// Unknown bits are preserved on decode and ignored by receivers so that
    /// newer senders can add flags without breaking older receivers. Senders
    /// must leave reserved bits zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// First packet a sender emits under a new epoch.
        const EPOCH_START = 0b0000_0001;
    }
}

impl PacketFlags {
    /// Whether this packet opens a new epoch.
    pub fn is_epoch_start(self) -> bool {
        self.contains(Self::EPOCH_START)
    }
}
