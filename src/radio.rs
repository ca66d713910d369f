//! The packet radio capability.
//!
//! A concrete driver (SX126x, SX127x, LR1110, a bench simulator, ...) implements [`Radio`] once
//! per hardware family. The stack only ever talks to the radio through this trait, from a single
//! polled loop: the driver may service interrupts internally, but everything it exposes here is
//! non-blocking poll-and-return, with level/edge transitions collapsed into booleans by the time
//! the dispatcher sees them.
//!
//! [`Radio`]: trait.Radio.html

/// Abstraction of this device's packet radio.
pub trait Radio {
    /// One-time hardware setup. Called from the dispatcher's `begin`.
    fn begin(&mut self) {}

    /// Polls for an incoming raw frame.
    ///
    /// Copies a complete received frame into `dest` and returns its length, or 0 when nothing has
    /// arrived. Frames longer than `dest` must be discarded by the driver.
    fn recv_raw(&mut self, dest: &mut [u8]) -> usize;

    /// Estimated transmit air-time for a frame of `len_bytes`, in milliseconds.
    ///
    /// This feeds both the transmit watchdog and the airtime duty-cycle budget, so it should err
    /// high rather than low.
    fn estimate_airtime_for(&self, len_bytes: usize) -> u32;

    /// Starts a raw frame transmission without waiting for completion.
    ///
    /// Returns `false` when the radio could not start sending; the dispatcher drops the packet
    /// and the sender discovers the loss through a missing acknowledgement.
    fn start_send_raw(&mut self, bytes: &[u8]) -> bool;

    /// Returns whether the transmission started by the last `start_send_raw` has completed.
    fn is_send_complete(&mut self) -> bool;

    /// Hook for any cleanup after a transmission has completed or timed out (eg. switching the
    /// transceiver back to receive).
    fn on_send_finished(&mut self) {}

    /// Returns whether the radio is currently mid-receive of a frame (listen-before-talk gate).
    fn is_receiving(&mut self) -> bool {
        false
    }

    /// RSSI of the last received frame, in dBm.
    fn last_rssi(&self) -> f32 {
        0.0
    }

    /// SNR of the last received frame, in dB.
    fn last_snr(&self) -> f32 {
        0.0
    }

    /// Scores the link quality of a reception in `0.0..=1.0`, given its SNR and length.
    ///
    /// Repeater-grade nodes may use this to prefer re-transmitting packets heard weakly (whose
    /// other neighbors likely missed them) ahead of packets heard loudly.
    fn packet_score(&self, _snr: f32, _packet_len: usize) -> f32 {
        1.0
    }
}
