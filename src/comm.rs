//! Message passing between ranks.
//!
//! The mesh runs SPMD: every rank executes the same program and exchanges
//! explicit messages. The [`Communicator`] trait encapsulates the transport;
//! implementors only provide tagged point-to-point `send` and `recv`, and the
//! trait derives the collectives the mesh needs (all-gather for refinement
//! flags, minimum reduction for the time step, element-wise sums for
//! conservation audits). Two implementations ship: [`SerialComm`] for a
//! single rank, and [`ChannelCluster`] which runs a group of ranks inside one
//! process over crossbeam channels.

use bytes::{Buf, BufMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::RefCell;

/// Message tag, unique per source-destination-leg within a step.
pub type Tag = u64;

/// Interface to a group of peer ranks exchanging messages. The transport can
/// in principle be shared-memory channels, TCP, or MPI.
pub trait Communicator {
    /// The rank of this process within the communicator.
    fn rank(&self) -> usize;

    /// The number of peer processes in this communicator.
    fn size(&self) -> usize;

    /// Sends a message to a peer. Must return immediately; it is not allowed
    /// to block until a matching receive is posted.
    fn send(&self, to: usize, tag: Tag, payload: Vec<u8>);

    /// Receives the message with the given tag from the given peer, blocking
    /// until it arrives. Messages with other tags are retained for later
    /// receives.
    fn recv(&self, from: usize, tag: Tag) -> Vec<u8>;

    /// Polls for the message with the given tag from the given peer without
    /// blocking.
    fn try_recv(&self, from: usize, tag: Tag) -> Option<Vec<u8>>;

    /// Gathers one buffer from every rank, in rank order.
    fn allgather(&self, mine: Vec<u8>) -> Vec<Vec<u8>> {
        let mut gathered = Vec::with_capacity(self.size());

        for peer in 0..self.size() {
            if peer != self.rank() {
                self.send(peer, COLLECTIVE_TAG, mine.clone());
            }
        }
        for peer in 0..self.size() {
            if peer == self.rank() {
                gathered.push(mine.clone());
            } else {
                gathered.push(self.recv(peer, COLLECTIVE_TAG));
            }
        }

        gathered
    }

    /// Reduces a scalar to its global minimum on every rank.
    fn allreduce_min(&self, value: f64) -> f64 {
        self.allgather(value.to_ne_bytes().to_vec())
            .into_iter()
            .map(|bytes| f64::from_ne_bytes(bytes.try_into().expect("scalar payload")))
            .fold(f64::INFINITY, f64::min)
    }

    /// Reduces a vector of scalars to their element-wise global sums.
    fn allreduce_sum(&self, values: &mut [f64]) {
        let gathered = self.allgather(pack_reals(values));
        values.fill(0.0);
        for bytes in gathered {
            for (total, term) in values.iter_mut().zip(unpack_reals(&bytes)) {
                *total += term;
            }
        }
    }

    /// Blocks until every rank has arrived.
    fn barrier(&self) {
        let _ = self.allgather(Vec::new());
    }
}

/// Tag reserved for the built-in collectives. Per-sender channels are FIFO,
/// so back-to-back collectives cannot overtake each other.
const COLLECTIVE_TAG: Tag = u64::MAX;

/// Packs a slice of reals into a byte payload.
pub fn pack_reals(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for &v in values {
        bytes.put_f64_ne(v);
    }
    bytes
}

/// Unpacks a byte payload produced by [`pack_reals`].
pub fn unpack_reals(mut bytes: &[u8]) -> Vec<f64> {
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while bytes.has_remaining() {
        values.push(bytes.get_f64_ne());
    }
    values
}

/// The trivial communicator for a single-rank run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _to: usize, _tag: Tag, _payload: Vec<u8>) {
        unreachable!("a serial communicator has no peers")
    }

    fn recv(&self, _from: usize, _tag: Tag) -> Vec<u8> {
        unreachable!("a serial communicator has no peers")
    }

    fn try_recv(&self, _from: usize, _tag: Tag) -> Option<Vec<u8>> {
        unreachable!("a serial communicator has no peers")
    }

    fn allgather(&self, mine: Vec<u8>) -> Vec<Vec<u8>> {
        vec![mine]
    }

    fn barrier(&self) {}
}

struct Packet {
    from: usize,
    tag: Tag,
    payload: Vec<u8>,
}

/// One member of a [`ChannelCluster`]: a rank communicating with its peers
/// over in-process channels. Owned by exactly one thread.
pub struct ChannelComm {
    rank: usize,
    peers: Vec<Sender<Packet>>,
    inbox: Receiver<Packet>,
    /// Received packets that did not match the posted `(from, tag)` yet.
    pending: RefCell<Vec<Packet>>,
}

/// Builder for a group of in-process ranks.
pub struct ChannelCluster;

impl ChannelCluster {
    /// Creates `size` connected communicators, one per rank. Each is meant to
    /// be moved onto its own thread.
    pub fn new(size: usize) -> Vec<ChannelComm> {
        assert!(size > 0);

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelComm {
                rank,
                peers: senders.clone(),
                inbox,
                pending: RefCell::new(Vec::new()),
            })
            .collect()
    }
}

impl ChannelComm {
    fn take_pending(&self, from: usize, tag: Tag) -> Option<Vec<u8>> {
        let mut pending = self.pending.borrow_mut();
        let slot = pending
            .iter()
            .position(|p| p.from == from && p.tag == tag)?;
        Some(pending.remove(slot).payload)
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: usize, tag: Tag, payload: Vec<u8>) {
        self.peers[to]
            .send(Packet {
                from: self.rank,
                tag,
                payload,
            })
            .expect("peer rank has shut down");
    }

    fn recv(&self, from: usize, tag: Tag) -> Vec<u8> {
        if let Some(payload) = self.take_pending(from, tag) {
            return payload;
        }

        loop {
            let packet = self.inbox.recv().expect("peer ranks have shut down");
            if packet.from == from && packet.tag == tag {
                return packet.payload;
            }
            self.pending.borrow_mut().push(packet);
        }
    }

    fn try_recv(&self, from: usize, tag: Tag) -> Option<Vec<u8>> {
        if let Some(payload) = self.take_pending(from, tag) {
            return Some(payload);
        }

        while let Ok(packet) = self.inbox.try_recv() {
            if packet.from == from && packet.tag == tag {
                return Some(packet.payload);
            }
            self.pending.borrow_mut().push(packet);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn serial_collectives() {
        let comm = SerialComm;
        assert_eq!(comm.allreduce_min(3.0), 3.0);
        let mut sums = [1.0, 2.0];
        comm.allreduce_sum(&mut sums);
        assert_eq!(sums, [1.0, 2.0]);
    }

    #[test]
    fn cluster_allgather_and_reduce() {
        let comms = ChannelCluster::new(3);

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let gathered = comm.allgather(vec![comm.rank() as u8]);
                    assert_eq!(gathered, vec![vec![0], vec![1], vec![2]]);

                    let minimum = comm.allreduce_min(10.0 - comm.rank() as f64);
                    assert_eq!(minimum, 8.0);

                    let mut sums = [comm.rank() as f64, 1.0];
                    comm.allreduce_sum(&mut sums);
                    assert_eq!(sums, [3.0, 3.0]);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn out_of_order_tags() {
        let mut comms = ChannelCluster::new(2);
        let b = comms.pop().unwrap();
        let a = comms.pop().unwrap();

        a.send(1, 7, vec![7]);
        a.send(1, 3, vec![3]);

        // The later-sent tag is requested first; the other is retained.
        assert_eq!(b.recv(0, 3), vec![3]);
        assert_eq!(b.recv(0, 7), vec![7]);
        assert_eq!(b.try_recv(0, 9), None);
    }
}
