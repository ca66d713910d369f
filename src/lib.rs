//! A LoRa store-and-forward mesh networking stack.
//!
//! Bramble lets battery-powered packet radios discover one another, exchange
//! end-to-end-encrypted unicast datagrams, multicast into group channels, and relay packets on
//! behalf of their neighbors. It targets tens of bytes of useful payload per transmission over a
//! half-duplex, lossy channel shared by every node in range.
//!
//! # Using the stack
//!
//! Bramble is runtime and hardware-agnostic: It does not need an RTOS (the whole stack is polled
//! from a single cooperative loop) and consumes hardware through a handful of capability traits
//! that need to be implemented once per board:
//! * A [`Radio`] that can start a raw transmission and poll for received frames.
//! * A monotonic [`MillisecondClock`] and a settable wall-clock [`RtcClock`].
//! * A cryptographically secure random number generator ([`rand_core::RngCore`]).
//!
//! These are bundled into a [`Config`] implementation, together with the packet pool and the
//! routing tables. Application behavior (who your peers are, what to do with a decrypted
//! message) is supplied through the [`MeshApp`] trait.
//!
//! [`Radio`]: radio/trait.Radio.html
//! [`MillisecondClock`]: time/trait.MillisecondClock.html
//! [`RtcClock`]: time/trait.RtcClock.html
//! [`Config`]: mesh/trait.Config.html
//! [`MeshApp`]: mesh/trait.MeshApp.html

#![no_std]

#[macro_use]
mod log;
#[macro_use]
pub mod utils;
pub mod acl;
pub mod bytes;
pub mod contact;
pub mod crypto;
pub mod dispatch;
mod error;
pub mod identity;
pub mod mesh;
pub mod packet;
pub mod pool;
pub mod radio;
pub mod tables;
pub mod time;

pub use self::error::Error;
