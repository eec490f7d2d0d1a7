//! Bookkeeping for outstanding transport operations and queued packets.

use crate::{
    id::{IdCounter, PortId, Token},
    packet::{Packet, PacketState},
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// The kind of operation a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Operation {
    Connect,
    Accept,
    Receive,
    Transmit,
    TransmitUrgent,
    Close,
}

/// Maps every outstanding token to the port and operation that issued it.
#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    counter: IdCounter,
    owners: FxHashMap<Token, (PortId, Operation)>,
}

impl TokenTable {
    pub fn issue(&mut self, port: PortId, op: Operation) -> Token {
        let token = Token::new(self.counter.next());
        self.owners.insert(token, (port, op));
        token
    }

    /// A token nothing will claim. Its completion is dropped on arrival.
    pub fn issue_unowned(&mut self) -> Token {
        Token::new(self.counter.next())
    }

    pub fn retire(&mut self, token: Token) -> Option<(PortId, Operation)> {
        self.owners.remove(&token)
    }

    pub fn retire_port(&mut self, port: PortId) {
        self.owners.retain(|_, (owner, _)| *owner != port);
    }

    pub fn outstanding(&self) -> usize {
        self.owners.len()
    }
}

/// One in-flight operation and the packet it carries.
#[derive(Debug, Default)]
pub(crate) struct IoSlot {
    token: Option<Token>,
    packet: Option<Packet>,
}

/// The active and free IO slots of one port queue (receive, transmit or
/// urgent transmit).
#[derive(Debug)]
pub(crate) struct IoQueue {
    active: Vec<IoSlot>,
    free: Vec<IoSlot>,
}

impl IoQueue {
    pub fn new(slots: usize) -> Self {
        Self {
            active: Vec::with_capacity(slots),
            free: (0..slots).map(|_| IoSlot::default()).collect(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free.is_empty()
    }

    /// Moves a free slot to the active list carrying `packet`. Gives the packet
    /// back when no slot is free.
    pub fn start(&mut self, token: Token, mut packet: Packet) -> Result<(), Packet> {
        let Some(mut slot) = self.free.pop() else {
            return Err(packet);
        };
        packet.transition(PacketState::InFlight);
        slot.token = Some(token);
        slot.packet = Some(packet);
        self.active.push(slot);
        Ok(())
    }

    /// Returns the slot for `token` to the free list and hands back its
    /// packet, still marked in flight.
    pub fn complete(&mut self, token: Token) -> Option<Packet> {
        let index = self
            .active
            .iter()
            .position(|slot| slot.token == Some(token))?;
        let mut slot = self.active.swap_remove(index);
        let packet = slot.packet.take();
        slot.token = None;
        self.free.push(slot);
        packet
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.active.iter().filter_map(|slot| slot.token).collect()
    }

    /// Empties every active slot.
    pub fn take_all(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        for mut slot in self.active.drain(..) {
            packets.extend(slot.packet.take());
            slot.token = None;
            self.free.push(slot);
        }
        packets
    }
}

/// A FIFO of packets with a running count of their unread bytes.
#[derive(Debug, Default)]
pub(crate) struct PacketQueue {
    packets: VecDeque<Packet>,
    total: usize,
}

impl PacketQueue {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Unread bytes across the queue.
    pub fn bytes(&self) -> usize {
        self.total
    }

    pub fn put(&mut self, mut packet: Packet) {
        if packet.state() != PacketState::Queued {
            packet.transition(PacketState::Queued);
        }
        self.total += packet.valid_bytes();
        self.packets.push_back(packet);
    }

    /// Puts a packet back at the head, as when a transmit could not start.
    pub fn put_front(&mut self, packet: Packet) {
        self.total += packet.valid_bytes();
        self.packets.push_front(packet);
    }

    pub fn get(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.total -= packet.valid_bytes();
        Some(packet)
    }

    pub fn front(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Consumes up to `count` bytes from the head packet. Returns the number of
    /// bytes consumed and whether the head packet is now empty.
    pub fn consume_front(&mut self, count: usize) -> (usize, bool) {
        let Some(packet) = self.packets.front_mut() else {
            return (0, false);
        };
        let consumed = packet.consume(count);
        self.total -= consumed;
        (consumed, packet.valid_bytes() == 0)
    }

    /// Removes every packet, leaving the count at zero.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.total = 0;
        self.packets.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{RxMeta, TxMeta};

    #[test]
    fn slot_moves_between_free_and_active() {
        let mut queue = IoQueue::new(1);
        let token = Token::new(1);
        let packet = Packet::with_capacity(8);
        assert!(queue.start(token, packet).is_ok());
        assert!(!queue.has_free_slot());

        let second = Packet::with_capacity(8);
        assert!(queue.start(Token::new(2), second).is_err());

        let packet = queue.complete(token).unwrap();
        assert_eq!(packet.state(), PacketState::InFlight);
        assert!(queue.is_idle());
        assert!(queue.complete(token).is_none());
    }

    #[test]
    fn queue_tracks_unread_bytes() {
        let mut queue = PacketQueue::default();
        let mut packet = Packet::with_capacity(16);
        packet.fill(b"abcdef", RxMeta::Tcp4 { urgent: false });
        queue.put(packet);
        queue.put(Packet::for_transmit(b"xyz", TxMeta::Tcp4 { urgent: false }));
        assert_eq!(queue.bytes(), 9);

        assert_eq!(queue.consume_front(4), (4, false));
        assert_eq!(queue.bytes(), 5);
        assert_eq!(queue.consume_front(4), (2, true));
        let head = queue.get().unwrap();
        assert_eq!(head.valid_bytes(), 0);
        assert_eq!(queue.bytes(), 3);
        assert_eq!(
            queue.bytes(),
            queue.iter().map(Packet::valid_bytes).sum::<usize>()
        );
    }

    #[test]
    fn tokens_are_unique_and_retired_once() {
        let mut table = TokenTable::default();
        let port = PortId::new(1);
        let a = table.issue(port, Operation::Receive);
        let b = table.issue(port, Operation::Transmit);
        assert_ne!(a, b);
        assert_eq!(table.retire(a), Some((port, Operation::Receive)));
        assert_eq!(table.retire(a), None);
        table.retire_port(port);
        assert_eq!(table.outstanding(), 0);
    }
}
