//! The dispatcher: sole owner of the radio.
//!
//! The dispatcher arbitrates the half-duplex channel between receiving and scheduled
//! transmissions. It guarantees:
//!
//! * at most one transmission in flight at any instant,
//! * no transmit while the radio reports a reception in progress (listen-before-talk),
//! * an airtime duty cycle: after occupying the air for `t` ms, the node stays silent for
//!   `t * budget_factor` ms (the only system-wide fairness mechanism),
//! * a watchdog on every transmission: if the radio does not report completion within 1.5x the
//!   estimated airtime, the packet is dropped and the dispatcher returns to idle with no budget
//!   penalty.
//!
//! ```notrust
//!      check_send() picks winner
//! IDLE ────────────────────────► TRANSMITTING
//!   ▲                                 │
//!   │ radio.is_send_complete()  ──────┤
//!   │  → record airtime, next_tx_time │
//!   │  → count, release               │
//!   │                                 │
//!   │ outbound_expiry exceeded ───────┘
//!   │   → free + IDLE (no penalty)
//!   │
//!   └── check_recv() drains radio ← radio.recv_raw()
//! ```
//!
//! Received frames are decoded, stamped with the last-hop SNR, counted, and handed to a
//! [`DispatchPolicy`], which decides between releasing the packet, keeping it for manual
//! processing, and scheduling it for retransmission.
//!
//! [`DispatchPolicy`]: trait.DispatchPolicy.html

use bitflags::bitflags;

use crate::packet::{Packet, MAX_PACKET_PAYLOAD, MAX_PATH_SIZE, MAX_TRANS_UNIT};
use crate::pool::{PacketHandle, PacketMgr};
use crate::radio::Radio;
use crate::time::{Duration, Instant, MillisecondClock};

/// What to do with a packet handed to [`DispatchPolicy::on_recv_packet`].
///
/// [`DispatchPolicy::on_recv_packet`]: trait.DispatchPolicy.html#tymethod.on_recv_packet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatcherAction {
    /// Free the packet immediately.
    Release,
    /// The policy has taken ownership of the handle and will free or queue it itself.
    ManualHold,
    /// Queue the packet for retransmission after `delay`.
    Retransmit { priority: u8, delay: Duration },
}

/// Receive-side behavior and per-role tuning supplied by the layer above.
pub trait DispatchPolicy<M: PacketMgr> {
    /// Called for every well-formed received packet. The packet's SNR field has been stamped and
    /// the receive counters updated.
    fn on_recv_packet(&mut self, mgr: &mut M, handle: PacketHandle) -> DispatcherAction;

    /// Multiplier applied to consumed airtime to compute the following radio-silence window.
    ///
    /// The default of 2.0 allows a ~33% duty cycle. Repeaters typically return 5.0 (~16.7%);
    /// regulatory-strict deployments use larger factors still.
    fn airtime_budget_factor(&self) -> f32 {
        2.0
    }
}

bitflags! {
    /// Sticky error events a diagnostics layer may poll. Cleared by [`Dispatcher::reset_stats`].
    ///
    /// [`Dispatcher::reset_stats`]: struct.Dispatcher.html#method.reset_stats
    pub struct ErrorFlags: u8 {
        /// A queue or the packet pool was full and a packet was dropped.
        const FULL = 1 << 0;
        /// Channel-activity detection kept the radio busy past its deadline (raised by drivers).
        const CAD_TIMEOUT = 1 << 1;
        /// The driver failed to re-enter receive mode in time (raised by drivers).
        const START_RX_TIMEOUT = 1 << 2;
    }
}

/// The low-level task that detects incoming packets and schedules outbound ones.
///
/// The dispatcher is pure state; every [`poll`] borrows the radio, the packet pool, and the clock
/// for the duration of the call.
///
/// [`poll`]: #method.poll
pub struct Dispatcher {
    outbound: Option<PacketHandle>,
    outbound_start: Instant,
    outbound_expiry: Instant,
    next_tx_time: Instant,
    total_air_time: u32,
    rx_air_time: u32,
    n_sent_flood: u32,
    n_sent_direct: u32,
    n_recv_flood: u32,
    n_recv_direct: u32,
    n_full_events: u32,
    err_flags: ErrorFlags,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            outbound: None,
            outbound_start: Instant::default(),
            outbound_expiry: Instant::default(),
            next_tx_time: Instant::default(),
            total_air_time: 0,
            rx_air_time: 0,
            n_sent_flood: 0,
            n_sent_direct: 0,
            n_recv_flood: 0,
            n_recv_direct: 0,
            n_full_events: 0,
            err_flags: ErrorFlags::empty(),
        }
    }

    /// Brings up the radio.
    pub fn begin<R: Radio>(&mut self, radio: &mut R) {
        radio.begin();
        info!("dispatcher: radio up");
    }

    /// Advances the dispatcher: completes or times out an in-flight transmission, drains at most
    /// one received frame, and starts the next due transmission if the channel allows it.
    pub fn poll<R, M, K, P>(&mut self, radio: &mut R, mgr: &mut M, clock: &K, policy: &mut P)
    where
        R: Radio,
        M: PacketMgr,
        K: MillisecondClock,
        P: DispatchPolicy<M>,
    {
        if let Some(handle) = self.outbound {
            if radio.is_send_complete() {
                let now = clock.now();
                let airtime = now.duration_since(self.outbound_start).as_millis();
                self.total_air_time = self.total_air_time.wrapping_add(airtime);

                // Radio silence up to next_tx_time.
                let silence = (airtime as f32 * policy.airtime_budget_factor()) as u32;
                self.next_tx_time = now + Duration::from_millis(silence);

                radio.on_send_finished();
                if mgr.packet(handle).is_route_flood() {
                    self.n_sent_flood += 1;
                } else {
                    self.n_sent_direct += 1;
                }
                mgr.free(handle);
                self.outbound = None;
            } else if clock.now().has_passed(self.outbound_expiry) {
                warn!("dispatcher: outbound packet send timed out");
                radio.on_send_finished();
                mgr.free(handle);
                self.outbound = None;
            } else {
                // No other radio activity until the send completes or times out.
                return;
            }
        }

        self.check_recv(radio, mgr, clock, policy);
        self.check_send(radio, mgr, clock);
    }

    fn check_recv<R, M, K, P>(&mut self, radio: &mut R, mgr: &mut M, clock: &K, policy: &mut P)
    where
        R: Radio,
        M: PacketMgr,
        K: MillisecondClock,
        P: DispatchPolicy<M>,
    {
        let mut raw = [0; MAX_TRANS_UNIT];
        let len = radio.recv_raw(&mut raw);
        if len == 0 {
            return;
        }

        let mut pkt = match Packet::read_from(&raw[..len]) {
            Ok(pkt) => pkt,
            Err(_) => {
                debug!("dispatcher: partial or corrupt packet received, len={}", len);
                return;
            }
        };
        pkt.snr = (radio.last_snr() * 4.0) as i8;

        let handle = match mgr.alloc() {
            Some(handle) => handle,
            None => {
                warn!("dispatcher: received data, no unused packets available");
                self.n_full_events += 1;
                self.err_flags |= ErrorFlags::FULL;
                return;
            }
        };

        if pkt.is_route_flood() {
            self.n_recv_flood += 1;
        } else {
            self.n_recv_direct += 1;
        }
        self.rx_air_time = self
            .rx_air_time
            .wrapping_add(radio.estimate_airtime_for(len));
        trace!(
            "dispatcher: recv len={} type={:?} snr={}",
            len,
            pkt.payload_type(),
            pkt.snr
        );

        *mgr.packet_mut(handle) = pkt;
        match policy.on_recv_packet(mgr, handle) {
            DispatcherAction::Release => mgr.free(handle),
            DispatcherAction::ManualHold => {}
            DispatcherAction::Retransmit { priority, delay } => {
                mgr.queue_outbound(handle, priority, clock.now() + delay);
            }
        }
    }

    fn check_send<R, M, K>(&mut self, radio: &mut R, mgr: &mut M, clock: &K)
    where
        R: Radio,
        M: PacketMgr,
        K: MillisecondClock,
    {
        let now = clock.now();
        if mgr.outbound_count(now) == 0 {
            return;
        }
        if !now.has_passed(self.next_tx_time) {
            return; // still in the radio-silence phase from the airtime budget
        }
        if radio.is_receiving() {
            return; // LBT: the channel is busy
        }

        let handle = match mgr.next_outbound(now) {
            Some(handle) => handle,
            None => return,
        };

        let mut raw = [0; MAX_TRANS_UNIT];
        let len = match mgr.packet(handle).write_to(&mut raw) {
            Ok(len) => len,
            Err(_) => {
                error!("dispatcher: invalid packet queued, too long");
                mgr.free(handle);
                return;
            }
        };

        let max_airtime = radio.estimate_airtime_for(len) * 3 / 2;
        self.outbound_start = now;
        if !radio.start_send_raw(&raw[..len]) {
            debug!("dispatcher: radio refused to start send");
            mgr.free(handle);
            return;
        }
        self.outbound = Some(handle);
        self.outbound_expiry = now + Duration::from_millis(max_airtime);
        trace!(
            "dispatcher: send len={} type={:?}",
            len,
            mgr.packet(handle).payload_type()
        );
    }

    /// Hands out a fresh packet with cleared lengths, counting pool exhaustion.
    pub fn obtain_new_packet<M: PacketMgr>(&mut self, mgr: &mut M) -> Option<PacketHandle> {
        let handle = mgr.alloc();
        if handle.is_none() {
            self.n_full_events += 1;
            self.err_flags |= ErrorFlags::FULL;
        }
        handle
    }

    /// Returns a packet to the pool.
    pub fn release_packet<M: PacketMgr>(&self, mgr: &mut M, handle: PacketHandle) {
        mgr.free(handle);
    }

    /// Queues a packet for transmission after an optional delay.
    ///
    /// A packet violating the size invariants is freed with an error log: that is a bug in the
    /// caller, not a runtime condition.
    pub fn send_packet<M: PacketMgr, K: MillisecondClock>(
        &mut self,
        mgr: &mut M,
        clock: &K,
        handle: PacketHandle,
        priority: u8,
        delay: Duration,
    ) {
        let pkt = mgr.packet(handle);
        if usize::from(pkt.path_len) > MAX_PATH_SIZE
            || usize::from(pkt.payload_len) > MAX_PACKET_PAYLOAD
        {
            error!(
                "dispatcher: invalid packet, path_len={} payload_len={}",
                pkt.path_len, pkt.payload_len
            );
            mgr.free(handle);
        } else {
            mgr.queue_outbound(handle, priority, clock.now() + delay);
        }
    }

    /// Lets a radio driver or wrapper record an error event for diagnostics.
    pub fn raise_error(&mut self, flags: ErrorFlags) {
        self.err_flags |= flags;
    }

    /// Total transmit airtime consumed, in milliseconds.
    pub fn total_air_time(&self) -> u32 {
        self.total_air_time
    }

    /// Total receive airtime observed, in milliseconds (estimated).
    pub fn rx_air_time(&self) -> u32 {
        self.rx_air_time
    }

    pub fn num_sent_flood(&self) -> u32 {
        self.n_sent_flood
    }

    pub fn num_sent_direct(&self) -> u32 {
        self.n_sent_direct
    }

    pub fn num_recv_flood(&self) -> u32 {
        self.n_recv_flood
    }

    pub fn num_recv_direct(&self) -> u32 {
        self.n_recv_direct
    }

    /// Number of times the pool was exhausted when a packet was needed.
    pub fn num_full_events(&self) -> u32 {
        self.n_full_events
    }

    /// Sticky error events; see [`ErrorFlags`].
    ///
    /// [`ErrorFlags`]: struct.ErrorFlags.html
    pub fn err_flags(&self) -> ErrorFlags {
        self.err_flags
    }

    /// Returns whether a transmission is currently in flight.
    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    /// Clears all counters and error flags.
    pub fn reset_stats(&mut self) {
        self.n_sent_flood = 0;
        self.n_sent_direct = 0;
        self.n_recv_flood = 0;
        self.n_recv_direct = 0;
        self.n_full_events = 0;
        self.err_flags = ErrorFlags::empty();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
