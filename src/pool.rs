//! Packet arena and scheduling queues.
//!
//! All packet storage is allocated up front: a fixed pool of [`Packet`]s is created at startup and
//! handed out as opaque [`PacketHandle`]s. Handles index into the arena; every access goes through
//! the manager, so queues can be reshuffled freely without dangling references.
//!
//! Two queues sit next to the pool:
//! * the *outbound* queue, ordered by (priority, scheduled-for): the dispatcher transmits the
//!   lowest-priority-value packet whose schedule time has been reached, first-queued winning ties,
//! * the *inbound* staging queue, used to defer processing of received packets.
//!
//! [`Packet`]: ../packet/struct.Packet.html
//! [`PacketHandle`]: struct.PacketHandle.html

use heapless::Vec;

use crate::packet::Packet;
use crate::time::Instant;

/// Opaque handle to a packet in a [`PacketMgr`]'s pool.
///
/// A handle is exclusive between `alloc` and `free`: whoever holds it may mutate the packet
/// through the manager, and must eventually hand it back (directly via `free`, or by queueing it
/// for transmission, which transfers it to the dispatcher).
///
/// [`PacketMgr`]: trait.PacketMgr.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHandle(u8);

/// Interface for managing packet instances and the outbound/inbound queues.
///
/// An implementation backed by a static pool is provided by [`StaticPacketPool`]; the trait exists
/// so that applications with unusual storage requirements can supply their own.
///
/// [`StaticPacketPool`]: struct.StaticPacketPool.html
pub trait PacketMgr {
    /// Hands out an unused packet, or `None` when the pool is exhausted.
    ///
    /// The returned packet has zeroed `path_len` and `payload_len`.
    fn alloc(&mut self) -> Option<PacketHandle>;

    /// Returns a packet to the pool.
    fn free(&mut self, handle: PacketHandle);

    /// Accesses the packet behind `handle`.
    fn packet(&self, handle: PacketHandle) -> &Packet;

    /// Mutably accesses the packet behind `handle`.
    fn packet_mut(&mut self, handle: PacketHandle) -> &mut Packet;

    /// Adds a packet to the send queue.
    ///
    /// Lower `priority` values win. The packet is invisible to the scheduler until
    /// `scheduled_for` has been reached. When the queue is full the packet is dropped and freed;
    /// this is not an error.
    fn queue_outbound(&mut self, handle: PacketHandle, priority: u8, scheduled_for: Instant);

    /// Removes and returns the best due outbound packet: highest priority among those whose
    /// schedule time is not in the future, ties broken by queue order.
    fn next_outbound(&mut self, now: Instant) -> Option<PacketHandle>;

    /// Counts outbound packets that are due at `now`.
    fn outbound_count(&self, now: Instant) -> usize;

    /// Peeks at the `i`-th outbound queue entry (including future-scheduled ones).
    fn outbound_at(&self, i: usize) -> Option<PacketHandle>;

    /// Removes the `i`-th outbound queue entry.
    fn remove_outbound_at(&mut self, i: usize) -> Option<PacketHandle>;

    /// Adds a packet to the inbound staging queue.
    fn queue_inbound(&mut self, handle: PacketHandle, scheduled_for: Instant);

    /// Removes and returns the next due inbound packet.
    fn next_inbound(&mut self, now: Instant) -> Option<PacketHandle>;

    /// Number of unused packets left in the pool.
    fn free_count(&self) -> usize;
}

struct QueueEntry {
    idx: u8,
    priority: u8,
    scheduled_for: Instant,
}

/// A [`PacketMgr`] backed by a fixed arena of `N` packets.
///
/// Chat-style nodes typically use 16 packets; repeaters, which juggle more simultaneous
/// retransmissions, 32.
///
/// [`PacketMgr`]: trait.PacketMgr.html
pub struct StaticPacketPool<const N: usize> {
    packets: [Packet; N],
    unused: Vec<u8, N>,
    outbound: Vec<QueueEntry, N>,
    inbound: Vec<QueueEntry, N>,
}

impl<const N: usize> StaticPacketPool<N> {
    /// Creates a pool with all `N` packets unused.
    pub fn new() -> Self {
        let mut unused = Vec::new();
        for i in 0..N {
            unused.push(i as u8).ok().expect("N fits its own capacity");
        }
        StaticPacketPool {
            packets: core::array::from_fn(|_| Packet::empty()),
            unused,
            outbound: Vec::new(),
            inbound: Vec::new(),
        }
    }

    fn best_due(queue: &[QueueEntry], now: Instant) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (i, e) in queue.iter().enumerate() {
            if e.scheduled_for.has_passed(now) {
                continue; // scheduled for the future
            }
            match best {
                Some((_, pri)) if e.priority >= pri => {}
                _ => best = Some((i, e.priority)),
            }
        }
        best.map(|(i, _)| i)
    }
}

impl<const N: usize> Default for StaticPacketPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PacketMgr for StaticPacketPool<N> {
    fn alloc(&mut self) -> Option<PacketHandle> {
        let idx = self.unused.pop()?;
        let pkt = &mut self.packets[usize::from(idx)];
        pkt.clear();
        Some(PacketHandle(idx))
    }

    fn free(&mut self, handle: PacketHandle) {
        debug_assert!(!self.unused.contains(&handle.0), "double free");
        if self.unused.push(handle.0).is_err() {
            debug_assert!(false, "pool overflow on free");
        }
    }

    fn packet(&self, handle: PacketHandle) -> &Packet {
        &self.packets[usize::from(handle.0)]
    }

    fn packet_mut(&mut self, handle: PacketHandle) -> &mut Packet {
        &mut self.packets[usize::from(handle.0)]
    }

    fn queue_outbound(&mut self, handle: PacketHandle, priority: u8, scheduled_for: Instant) {
        let entry = QueueEntry {
            idx: handle.0,
            priority,
            scheduled_for,
        };
        if self.outbound.push(entry).is_err() {
            warn!("outbound queue full, dropping packet");
            self.free(handle);
        }
    }

    fn next_outbound(&mut self, now: Instant) -> Option<PacketHandle> {
        let i = Self::best_due(&self.outbound, now)?;
        Some(PacketHandle(self.outbound.remove(i).idx))
    }

    fn outbound_count(&self, now: Instant) -> usize {
        self.outbound
            .iter()
            .filter(|e| !e.scheduled_for.has_passed(now))
            .count()
    }

    fn outbound_at(&self, i: usize) -> Option<PacketHandle> {
        self.outbound.get(i).map(|e| PacketHandle(e.idx))
    }

    fn remove_outbound_at(&mut self, i: usize) -> Option<PacketHandle> {
        if i < self.outbound.len() {
            Some(PacketHandle(self.outbound.remove(i).idx))
        } else {
            None
        }
    }

    fn queue_inbound(&mut self, handle: PacketHandle, scheduled_for: Instant) {
        let entry = QueueEntry {
            idx: handle.0,
            priority: 0,
            scheduled_for,
        };
        if self.inbound.push(entry).is_err() {
            warn!("inbound queue full, dropping packet");
            self.free(handle);
        }
    }

    fn next_inbound(&mut self, now: Instant) -> Option<PacketHandle> {
        let i = Self::best_due(&self.inbound, now)?;
        Some(PacketHandle(self.inbound.remove(i).idx))
    }

    fn free_count(&self) -> usize {
        self.unused.len()
    }
}
