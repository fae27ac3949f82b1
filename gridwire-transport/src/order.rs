//! Delivery ordering and its encoding in message flags.
//!
//! The group substrate only understands flags, the transport only
//! understands [`DeliverOrder`]. The mapping between the two is a bijection:
//!
//! | order        | flags                    |
//! |--------------|--------------------------|
//! | `Total`      | none                     |
//! | `PerSender`  | `NO_TOTAL_ORDER`         |
//! | `None`       | `OOB \| NO_TOTAL_ORDER`  |
//!
//! `OOB` without `NO_TOTAL_ORDER` is not a valid combination and is rejected
//! as a protocol error.

use bitflags::bitflags;

use crate::wire::WireError;

bitflags! {
    /// Per-message flags handed to the group substrate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u16 {
        /// Out-of-band: the substrate may deliver out of send order.
        const OOB = 1;
        /// Bypass the total order protocol.
        const NO_TOTAL_ORDER = 1 << 1;
        /// Send immediately, without bundling.
        const DONT_BUNDLE = 1 << 2;
        /// Bypass credit-based flow control.
        const NO_FLOW_CONTROL = 1 << 3;
        /// Do not deliver a broadcast back to its sender.
        const DONT_LOOPBACK = 1 << 4;
    }
}

impl MessageFlags {
    /// The subset of flags that encodes delivery order.
    pub const ORDERING: MessageFlags =
        MessageFlags::OOB.union(MessageFlags::NO_TOTAL_ORDER);

    /// Flags with ordering bits stripped.
    pub fn without_ordering(self) -> MessageFlags {
        self.difference(MessageFlags::ORDERING)
    }
}

/// Delivery ordering requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverOrder {
    /// No ordering; inbound work may run concurrently.
    None,
    /// FIFO per sender.
    PerSender,
    /// Same global order on every member.
    Total,
}

impl DeliverOrder {
    /// Encode this order as substrate flags.
    pub fn to_flags(self) -> MessageFlags {
        match self {
            DeliverOrder::Total => MessageFlags::empty(),
            DeliverOrder::PerSender => MessageFlags::NO_TOTAL_ORDER,
            DeliverOrder::None => MessageFlags::OOB | MessageFlags::NO_TOTAL_ORDER,
        }
    }

    /// Decode the order from substrate flags, ignoring non-ordering bits.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidOrderFlags`] for `OOB` without
    /// `NO_TOTAL_ORDER`.
    pub fn from_flags(flags: MessageFlags) -> Result<Self, WireError> {
        let ordering = flags.intersection(MessageFlags::ORDERING);
        if ordering.is_empty() {
            Ok(DeliverOrder::Total)
        } else if ordering == MessageFlags::NO_TOTAL_ORDER {
            Ok(DeliverOrder::PerSender)
        } else if ordering == MessageFlags::ORDERING {
            Ok(DeliverOrder::None)
        } else {
            Err(WireError::InvalidOrderFlags {
                bits: flags.bits(),
            })
        }
    }

    /// Whether messages in this order go through the total order protocol.
    pub fn is_total(self) -> bool {
        self == DeliverOrder::Total
    }
}

impl std::fmt::Display for DeliverOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeliverOrder::None => "NONE",
            DeliverOrder::PerSender => "PER_SENDER",
            DeliverOrder::Total => "TOTAL",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_flag_bijection() {
        for order in [DeliverOrder::None, DeliverOrder::PerSender, DeliverOrder::Total] {
            assert_eq!(DeliverOrder::from_flags(order.to_flags()).ok(), Some(order));
        }
    }

    #[test]
    fn test_non_ordering_bits_are_ignored() {
        let flags = DeliverOrder::PerSender.to_flags() | MessageFlags::DONT_BUNDLE;
        assert_eq!(DeliverOrder::from_flags(flags).ok(), Some(DeliverOrder::PerSender));
        assert_eq!(flags.without_ordering(), MessageFlags::DONT_BUNDLE);
    }

    #[test]
    fn test_oob_alone_is_rejected() {
        let err = DeliverOrder::from_flags(MessageFlags::OOB).expect_err("invalid combination");
        assert!(matches!(err, WireError::InvalidOrderFlags { bits: 1 }));
    }
}
