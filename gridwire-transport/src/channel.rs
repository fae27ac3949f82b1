//! Seam to the group-communication substrate.
//!
//! The substrate owns membership, failure detection and reliable delivery.
//! The transport drives it through [`GroupChannel`] and is driven by it
//! through the `on_*` entry points of [`GroupTransport`](crate::GroupTransport).

use gridwire_core::Address;

use crate::error::ChannelError;
use crate::order::MessageFlags;

/// Outbound half of the group-communication substrate.
///
/// Sends never block: the substrate queues internally and reports only
/// immediate failures. Delivery honours the ordering bits of `flags`.
pub trait GroupChannel {
    /// Address of the local member.
    fn local_address(&self) -> Address;

    /// Send to one member, or to every member when `destination` is `None`.
    fn send(
        &self,
        destination: Option<&Address>,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError>;

    /// Send one message to an explicit set of members.
    ///
    /// Used for totally ordered anycasts, where every recipient must see the
    /// message at the same position of the global order.
    fn send_to_many(
        &self,
        destinations: &[Address],
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError>;

    /// Send to the site master of a remote site.
    fn send_to_site(
        &self,
        site: &str,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<(), ChannelError>;

    /// Whether a broadcast reaches every member with one send.
    fn is_multicast_capable(&self) -> bool {
        true
    }
}
