//! QH (queue head) hardware layout, configuration, and period derivation.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;

use crate::config::EHCI_QH_NBUFS;
use crate::dma::PhysAddr;
use crate::qtd::QtdToken;
use crate::stack::Speed;

#[bitfield(u32)]
pub struct QhInfo1 {
    #[bits(7)]
    pub device_addr: u8,
    #[bits(1)]
    pub inactivate_on_next: bool,
    #[bits(4)]
    pub endpoint: u8,
    #[bits(2)]
    pub speed: u8,
    #[bits(1)]
    pub control_dt: bool,
    #[bits(1)]
    pub head_of_reclamation: bool,
    #[bits(11)]
    pub max_packet_size: u16,
    #[bits(1)]
    pub control_endpoint: bool,
    #[bits(4)]
    pub nak_reload: u8,
}

#[bitfield(u32)]
pub struct QhInfo2 {
    #[bits(8)]
    pub smask: u8,
    #[bits(8)]
    pub cmask: u8,
    #[bits(7)]
    pub hub_addr: u8,
    #[bits(7)]
    pub port_number: u8,
    #[bits(2)]
    pub mult: u8,
}

/// Hardware-format QH (48 bytes fixed, plus the overlay the controller
/// owns during execution).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QhHw {
    pub horiz_link: u32,
    pub info1: QhInfo1,
    pub info2: QhInfo2,
    pub current_qtd: u32,
    // Overlay: mirrors the active qTD's shape. Hardware-owned during
    // execution; the driver must not treat it as canonical queue shape
    // and keeps its own `last_qtd` cursor instead.
    pub next_qtd: u32,
    pub alt_next_qtd: u32,
    pub token: QtdToken,
    pub buffer: [u32; EHCI_QH_NBUFS],
}

// 48-byte fixed QH shape the controller expects (horiz_link/info1/info2/
// current_qtd plus the 32-byte overlay); a size regression here means a
// field was added or misbitted.
const_assert_eq!(core::mem::size_of::<QhHw>(), 48);

impl Default for QhHw {
    fn default() -> Self {
        Self {
            horiz_link: PhysAddr::INVALID.raw(),
            info1: QhInfo1::new(),
            info2: QhInfo2::new(),
            current_qtd: PhysAddr::INVALID.raw(),
            next_qtd: PhysAddr::INVALID.raw(),
            alt_next_qtd: PhysAddr::INVALID.raw(),
            token: QtdToken::new(),
            buffer: [0; EHCI_QH_NBUFS],
        }
    }
}

/// Configuration parameters derived from a pipe, used to (re)configure a QH.
#[derive(Clone, Copy, Debug)]
pub struct QhConfig {
    pub device_addr: u8,
    pub endpoint: u8,
    pub speed: Speed,
    pub max_packet_size: u16,
    pub is_control: bool,
    pub nak_reload: u8,
}

impl QhHw {
    /// Zeroes the QH and sets horizontal/current/next/alt to INVALID, per
    /// the pool's allocation contract.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Configures a QH on first use of a pipe.
    pub fn configure(&mut self, cfg: QhConfig) {
        let mut info1 = QhInfo1::new()
            .with_device_addr(cfg.device_addr)
            .with_endpoint(cfg.endpoint)
            .with_speed(cfg.speed as u8)
            .with_max_packet_size(cfg.max_packet_size)
            .with_control_endpoint(cfg.is_control)
            .with_nak_reload(cfg.nak_reload);

        if cfg.is_control {
            // Control-endpoint data toggle comes from qTD tokens, not the
            // QH, so the QH's own DT-control bit stays clear; but on
            // non-high-speed links the "control endpoint" flag must be set
            // so the controller re-issues the status phase at full speed.
            if cfg.speed != Speed::High {
                info1 = info1.with_control_dt(true);
            }
        }
        self.info1 = info1;
    }

    /// Rewrites only the device-address / max-packet-size bitfields on
    /// reuse, leaving the rest of the hardware-visible state untouched.
    pub fn refresh_address(&mut self, device_addr: u8, max_packet_size: u16) {
        self.info1 = self.info1.with_device_addr(device_addr).with_max_packet_size(max_packet_size);
    }

    pub fn set_head_of_reclamation(&mut self, set: bool) {
        self.info1 = self.info1.with_head_of_reclamation(set);
    }

    /// Writes the periodic schedule's S-mask/C-mask for this QH.
    pub fn set_masks(&mut self, smask: u8, cmask: u8) {
        self.info2 = self.info2.with_smask(smask).with_cmask(cmask);
    }
}

/// Derives a QH's scheduling period in frames from `bInterval`.
pub fn period_from_binterval(speed: Speed, binterval: u8) -> u32 {
    match speed {
        Speed::High => {
            if binterval == 0 {
                1
            } else {
                let frames = 1u32 << (binterval.saturating_sub(1));
                (frames / 8).max(1)
            }
        }
        Speed::Full | Speed::Low => {
            if binterval <= 1 {
                1
            } else {
                // Largest power of two strictly less than bInterval.
                let mut p = 1u32;
                while p * 2 < binterval as u32 {
                    p *= 2;
                }
                p
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binterval_1_high_speed_every_microframe_period() {
        assert_eq!(period_from_binterval(Speed::High, 1), 1);
    }

    #[test]
    fn binterval_4_high_speed_period_1_frame() {
        // 2^(4-1)/8 = 8/8 = 1
        assert_eq!(period_from_binterval(Speed::High, 4), 1);
    }

    #[test]
    fn binterval_7_high_speed_period_8_frames() {
        // 2^(7-1)/8 = 64/8 = 8
        assert_eq!(period_from_binterval(Speed::High, 7), 8);
    }

    #[test]
    fn full_speed_period_is_power_of_two_below_binterval() {
        assert_eq!(period_from_binterval(Speed::Full, 10), 8);
        assert_eq!(period_from_binterval(Speed::Full, 1), 1);
        assert_eq!(period_from_binterval(Speed::Full, 0), 1);
    }
}
