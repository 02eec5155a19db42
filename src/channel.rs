//! Channel bookkeeping: the per-direction channel-number maps, payload
//! handler propagation, and the running byte counters that feed stream
//! reassembly.
//!
//! Channel numbers are only unique within one direction at one point in
//! time; a number reused after close silently continues the old
//! channel's history. That ambiguity is inherited from the protocol
//! (nothing on the wire disambiguates a reuse) and is deliberately not
//! "fixed" here.

use std::collections::HashMap;

use crate::reassembly::StreamReassembler;
use crate::Direction;

/// What consumes a channel's byte stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelHandler {
    Subsystem(String),
    Exec(String),
    Shell,
}

/// One SSH channel as seen from one peer, keyed by the channel number
/// the *sender* of channel messages uses (its recipient-channel id).
#[derive(Debug, Default)]
pub struct Channel {
    /// The matching channel number in the other peer's namespace, when
    /// a CHANNEL_OPEN_CONFIRMATION established the pairing.
    pub peer_channel: Option<u32>,
    /// Running byte counter across CHANNEL_DATA/EXTENDED_DATA.
    pub byte_count: u64,
    pub handler: Option<ChannelHandler>,
    pub reassembler: StreamReassembler,
}

#[derive(Debug, Default)]
struct PeerChannels {
    /// recipient-channel id (as used by this peer's outgoing channel
    /// messages) -> channel state.
    channels: HashMap<u32, Channel>,
    /// sender id -> recipient id, recorded from this peer's
    /// CHANNEL_OPEN_CONFIRMATION messages.
    channel_map: HashMap<u32, u32>,
}

/// Channel state for both directions of one connection.
#[derive(Debug, Default)]
pub struct ChannelMux {
    peers: [PeerChannels; 2],
}

impl ChannelMux {
    pub fn new() -> Self {
        Self::default()
    }

    fn peer(&self, direction: Direction) -> &PeerChannels {
        &self.peers[direction.index()]
    }

    fn peer_mut(&mut self, direction: Direction) -> &mut PeerChannels {
        &mut self.peers[direction.index()]
    }

    /// CHANNEL_OPEN_CONFIRMATION observed from `direction`.
    ///
    /// Records the id pairing and creates the channel object. If the
    /// other peer already registered a handler under `sender_channel`
    /// (a request observed before the confirmation, as happens with
    /// port forwarding), that handler is propagated to the new channel.
    pub fn on_open_confirmation(
        &mut self,
        direction: Direction,
        recipient_channel: u32,
        sender_channel: u32,
    ) {
        let inherited = self
            .peer(direction.other())
            .channels
            .get(&sender_channel)
            .and_then(|channel| channel.handler.clone());

        let peer = self.peer_mut(direction);
        peer.channel_map.insert(sender_channel, recipient_channel);
        let channel = peer.channels.entry(recipient_channel).or_default();
        channel.peer_channel = Some(sender_channel);
        if channel.handler.is_none() {
            if let Some(handler) = inherited {
                debug!(
                    "channel {}: inheriting handler {:?} from peer channel {}",
                    recipient_channel, handler, sender_channel
                );
                channel.handler = Some(handler);
            }
        }
    }

    /// A subsystem/exec/shell CHANNEL_REQUEST observed from `direction`
    /// for `recipient_channel`.
    ///
    /// The handler is stored on the sender's channel (created lazily if
    /// the open/confirmation was missed) and propagated through the
    /// other peer's id mapping to the cross-referenced channel.
    pub fn assign_handler(
        &mut self,
        direction: Direction,
        recipient_channel: u32,
        handler: ChannelHandler,
    ) {
        let peer = self.peer_mut(direction);
        let channel = peer.channels.entry(recipient_channel).or_default();
        channel.handler = Some(handler.clone());

        if let Some(&mapped) = self
            .peer(direction.other())
            .channel_map
            .get(&recipient_channel)
        {
            let other = self.peer_mut(direction.other());
            if let Some(channel) = other.channels.get_mut(&mapped) {
                channel.handler = Some(handler);
            }
        }
    }

    /// CHANNEL_DATA/EXTENDED_DATA accounting. Returns the byte offset
    /// this chunk starts at within the channel's logical stream, or
    /// `None` for a channel never seen opened.
    pub fn on_data(
        &mut self,
        direction: Direction,
        recipient_channel: u32,
        len: usize,
    ) -> Option<u64> {
        let peer = self.peer_mut(direction);
        let channel = peer.channels.get_mut(&recipient_channel)?;
        let byte_seq = channel.byte_count;
        channel.byte_count += len as u64;
        Some(byte_seq)
    }

    /// Channel lookup in one peer's namespace.
    pub fn get_channel(&self, direction: Direction, recipient_channel: u32) -> Option<&Channel> {
        self.peer(direction).channels.get(&recipient_channel)
    }

    pub fn get_channel_mut(
        &mut self,
        direction: Direction,
        recipient_channel: u32,
    ) -> Option<&mut Channel> {
        self.peer_mut(direction).channels.get_mut(&recipient_channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_peer_handler_propagation() {
        let mut mux = ChannelMux::new();
        // Server confirms: its messages will call the channel 5, the
        // client's will call it 7.
        mux.on_open_confirmation(Direction::ServerToClient, 5, 7);
        assert!(mux.get_channel(Direction::ServerToClient, 5).is_some());

        // Client requests the sftp subsystem on its channel 7.
        mux.assign_handler(
            Direction::ClientToServer,
            7,
            ChannelHandler::Subsystem("sftp".into()),
        );

        let server_side = mux.get_channel(Direction::ServerToClient, 5).unwrap();
        assert_eq!(
            server_side.handler,
            Some(ChannelHandler::Subsystem("sftp".into()))
        );
        let client_side = mux.get_channel(Direction::ClientToServer, 7).unwrap();
        assert_eq!(
            client_side.handler,
            Some(ChannelHandler::Subsystem("sftp".into()))
        );
    }

    #[test]
    fn test_handler_inherited_on_late_confirmation() {
        let mut mux = ChannelMux::new();
        // Handler assigned before the confirmation arrives.
        mux.assign_handler(
            Direction::ClientToServer,
            7,
            ChannelHandler::Exec("rsync".into()),
        );
        mux.on_open_confirmation(Direction::ServerToClient, 5, 7);
        let server_side = mux.get_channel(Direction::ServerToClient, 5).unwrap();
        assert_eq!(server_side.handler, Some(ChannelHandler::Exec("rsync".into())));
    }

    #[test]
    fn test_byte_counter() {
        let mut mux = ChannelMux::new();
        mux.on_open_confirmation(Direction::ServerToClient, 3, 4);
        assert_eq!(mux.on_data(Direction::ServerToClient, 3, 10), Some(0));
        assert_eq!(mux.on_data(Direction::ServerToClient, 3, 10), Some(10));
        assert_eq!(mux.on_data(Direction::ServerToClient, 3, 5), Some(20));
        // Unknown channel: reported, not fatal.
        assert_eq!(mux.on_data(Direction::ServerToClient, 99, 5), None);
    }
}
