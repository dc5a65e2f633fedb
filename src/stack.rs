//! The external USB-stack contract.
//!
//! Everything in this module is the interface the generic USB stack is
//! expected to provide, or to receive calls through. It is modeled here as
//! plain Rust types/traits rather than a C vtable, the way a USB device
//! controller driver implements a `Bus`-shaped trait supplied by its
//! collaborator crate — except here the roles are reversed: this crate is
//! the caller, not the implementer, of the stack's callbacks.

use crate::dma::PhysAddr;
use crate::error::Error;

/// Device signaling speed. Numeric values match the QH `info1.speed`
/// encoding directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Speed {
    Low = 0,
    Full = 1,
    High = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
}

/// USB control setup packet, carried verbatim in the SETUP qTD.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Serializes to the 8-byte wire layout USB defines for a SETUP packet
    /// (little-endian multi-byte fields).
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.request_type;
        buf[1] = self.request;
        buf[2..4].copy_from_slice(&self.value.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }
}

/// Device metadata the stack supplies for every pipe.
#[derive(Clone, Copy, Debug)]
pub struct Device {
    pub address: u8,
    pub speed: Speed,
    /// Hub address/port, for non-high-speed devices behind a high-speed
    /// hub (split-transaction targeting; transaction-translator scheduling
    /// itself is out of scope).
    pub hub_addr: u8,
    pub hub_port: u8,
}

/// An endpoint pipe. `hcdpriv` is this driver's slot to stash its `QhHandle`.
pub struct Pipe {
    pub device: Device,
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// `bInterval`, meaningful for interrupt pipes only.
    pub interval: u8,
    pub hcdpriv: crate::pool::OptionalQhHandle,
}

/// One in-flight (or about-to-be-submitted) transfer.
///
/// `finished` is a plain function pointer rather than a borrowed closure:
/// completion is interrupt-driven and happens long after `transfer_enqueue`
/// returns, so the driver must be able to retain it past the call that
/// submitted the transfer.
pub struct Transfer {
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub setup: Option<SetupPacket>,
    /// Physical address of the transfer's data buffer. The generic stack
    /// owns buffer allocation/mapping; this driver only ever sees the
    /// physical address it must write into descriptor pointer fields.
    pub buffer: PhysAddr,
    pub size: usize,
    /// Opaque pointer the stack can use to recover its own transfer object
    /// from `usb_transferFinished`.
    pub private: *mut (),
    pub finished: fn(*mut (), i32),
}

/// `usb_transferCheck`: lets the stack veto/inspect a transfer before the
/// reaper reports it, e.g. to special-case a short-packet-is-ok bulk read.
/// Returning `None` accepts the driver's own classification.
pub trait TransferCheck {
    fn check(&self, transfer_private: *mut (), status: i32, bytes: usize) -> Option<i32>;
}

/// Roothub collaborator: the predicate identifying a roothub pipe, and the
/// dispatcher for requests targeting it.
pub trait Roothub {
    fn is_roothub_pipe(&self, pipe: &Pipe) -> bool;
    fn dispatch(&self, transfer: &Transfer) -> i32;
    fn status(&self) -> u32;
}

/// The downward-facing operations the generic USB stack calls into this
/// driver through, registered once via [`hcd_register`].
///
/// Modeled as a capability record of function values rather than a trait
/// object, avoiding dynamic-dispatch machinery for a boundary this small.
#[derive(Clone, Copy)]
pub struct HcdOps {
    pub init: fn() -> i32,
    pub transfer_enqueue: fn(transfer: &Transfer, pipe: &mut Pipe) -> i32,
    pub transfer_dequeue: fn(transfer: &Transfer),
    pub pipe_destroy: fn(pipe: &mut Pipe),
    pub get_roothub_status: fn() -> u32,
}

/// Converts a driver [`Error`] to the negative status code the `hcd_ops`
/// boundary reports, without an orphaned `From` impl on a primitive type.
pub fn status_of(result: Result<(), Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_status(),
    }
}
