//! `EhciHcd`: the facade that owns the register blocks, the descriptor
//! pools, both schedules, and the concurrency primitives, and implements
//! the downward `hcd_ops` surface.
//!
//! Lock discipline: `transfer_lock` is always acquired before
//! `schedule_lock`. The IRQ lock is the `critical_section` inside
//! [`crate::irq::IrqState`] and is never held across an `.await` — the
//! worker only takes it for the instant it swaps the status word out.
//!
//! `schedule_lock` merges the async and periodic schedules' locks into one
//! `embassy_sync` blocking mutex, since both schedules share the same
//! [`DescriptorPools`] instance and every operation this driver performs
//! touches the pools; see `DESIGN.md` for the tradeoff.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::async_list::AsyncList;
use crate::dma::{DmaAllocator, PhysAddr};
use crate::error::Error;
use crate::irq::{self, IrqState, StatusHandler};
use crate::periodic::PeriodicList;
use crate::pool::{DescriptorPools, PendingTransfer, QhHandle, QtdHandle};
use crate::qh::{period_from_binterval, QhConfig};
use crate::qtd::{build_qtd, Pid, QtdHw, QtdToken};
use crate::regs::{cmd, CapRegs, OpRegs};
use crate::stack::{Direction, Pipe, Roothub, Transfer, TransferType};

struct Schedule<'a, A: DmaAllocator> {
    pools: DescriptorPools<'a, A>,
    async_list: AsyncList,
    periodic: PeriodicList,
}

/// Owns one EHCI controller's schedule manager.
pub struct EhciHcd<'a, A: DmaAllocator> {
    cap: CapRegs,
    op: OpRegs,
    schedule: Mutex<CriticalSectionRawMutex, RefCell<Schedule<'a, A>>>,
    transfer_lock: Mutex<CriticalSectionRawMutex, RefCell<()>>,
    irq: IrqState,
}

// Single-core embedded target: nothing here is ever touched from two
// execution contexts at once without the mutex/critical-section already
// serializing access, so the raw `*mut ()` callback payload riding inside
// `PendingTransfer` doesn't threaten soundness.
unsafe impl<'a, A: DmaAllocator> Send for EhciHcd<'a, A> {}
unsafe impl<'a, A: DmaAllocator> Sync for EhciHcd<'a, A> {}

impl<'a, A: DmaAllocator> EhciHcd<'a, A> {
    /// # Safety
    /// `cap_base` must be the live virtual address of this controller's
    /// EHCI capability register block, mapped for the lifetime of the
    /// returned value.
    pub unsafe fn new(cap_base: usize, alloc: &'a A, qtd_cap: usize, qh_cap: usize) -> Result<Self, Error> {
        if cap_base % 32 != 0 {
            return Err(Error::InvalidConfiguration);
        }

        let cap = CapRegs::new(cap_base);
        let op_base = cap_base + cap.caplength() as usize;
        let op = OpRegs::new(op_base);

        let mut pools = DescriptorPools::new(alloc, qtd_cap, qh_cap);
        let periodic = PeriodicList::new(alloc)?;
        let async_list = AsyncList::new(&mut pools)?;

        Ok(Self {
            cap,
            op,
            schedule: Mutex::new(RefCell::new(Schedule { pools, async_list, periodic })),
            transfer_lock: Mutex::new(RefCell::new(())),
            irq: IrqState::new(),
        })
    }

    /// Resets and starts the controller, in order: HCRESET, PHY/host-mode
    /// select, port claim + settle, frame-list base and async dummy head
    /// programmed, interrupt enables, RUN bit set, schedule status
    /// confirmed running.
    pub fn init(&self) -> Result<(), Error> {
        self.op.modify_usbcmd(|v| v | cmd::HCRESET);
        Self::spin_until_with_timeout(|| self.op.usbcmd() & cmd::HCRESET == 0)?;

        self.op.set_ctrldssegment(0);

        #[cfg(feature = "imx-rt")]
        self.op.set_host_mode();

        // Claim every port for this controller (CONFIGFLAG) and give
        // attached devices their mandatory port power-on settle time before
        // the first PORTSC read elsewhere is trusted.
        self.op.set_configflag(1);
        for port in 0..self.cap.n_ports() {
            let _ = self.op.portsc(port);
        }
        Self::delay_ms(50);

        self.schedule.lock(|s| {
            let s = s.borrow();
            s.periodic.enable(&self.op);
            s.async_list.arm(&s.pools, &self.op);
        });

        let fls = if crate::config::EHCI_PERIODIC_SIZE <= 128 { cmd::FLS_128 } else { cmd::FLS_1024 };
        self.op.set_usbintr(
            crate::regs::sts::USBINT | crate::regs::sts::USBERRINT | crate::regs::sts::PORT_CHANGE | crate::regs::sts::SYSTEM_ERROR,
        );
        self.op.modify_usbcmd(|v| (v & !(0b11 << 2)) | fls | cmd::RUN);

        // Both enable bits were armed above, before RUN; the status mirrors
        // only assert once the controller is actually running, so the
        // confirmation spins happen here, after RUN.
        self.op.spin_until_periodic_status(true);
        self.op.spin_until_async_status(true);

        Ok(())
    }

    /// Polls `done` until it reports true, bounding the wait by a deadline
    /// when the `time` feature is enabled. Without the feature this
    /// degrades to an unbounded spin, since there's no timebase to bound
    /// it with.
    #[cfg(feature = "time")]
    fn spin_until_with_timeout(mut done: impl FnMut() -> bool) -> Result<(), Error> {
        let deadline = embassy_time::Instant::now() + embassy_time::Duration::from_millis(100);
        while !done() {
            if embassy_time::Instant::now() > deadline {
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    #[cfg(not(feature = "time"))]
    fn spin_until_with_timeout(mut done: impl FnMut() -> bool) -> Result<(), Error> {
        while !done() {
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Busy-waits `ms` milliseconds when the `time` feature provides a
    /// timebase; a no-op otherwise, since there's nothing to bound the wait
    /// with (the caller has no hard dependency on the settle time having
    /// actually elapsed — PORTSC is re-read before it's trusted regardless).
    #[cfg(feature = "time")]
    fn delay_ms(ms: u64) {
        let deadline = embassy_time::Instant::now() + embassy_time::Duration::from_millis(ms);
        while embassy_time::Instant::now() < deadline {
            core::hint::spin_loop();
        }
    }

    #[cfg(not(feature = "time"))]
    fn delay_ms(_ms: u64) {}

    pub fn n_ports(&self) -> u8 {
        self.cap.n_ports()
    }

    /// ISR entry point. Forward the platform's interrupt vector here.
    pub fn on_interrupt(&self) {
        self.irq.on_interrupt(&self.op);
    }

    /// Runs the worker loop forever. Spawn as a task, or poll from
    /// whatever executor the platform uses.
    pub async fn run_worker(&self) -> ! {
        irq::worker_loop(&self.irq, self).await
    }

    /// `usb_transferEnqueue`: assigns a QH to `pipe` on
    /// first use, builds the qTD ring for `transfer`, and links both into
    /// the right schedule.
    pub fn transfer_enqueue(&self, transfer: &Transfer, pipe: &mut Pipe) -> Result<(), Error> {
        // `transfer_lock` is acquired first and held (by nesting the
        // schedule-lock call inside its critical section) for the whole
        // operation, so no second submission on this pipe can race the
        // pending-transfer check below.
        self.transfer_lock.lock(|_| self.enqueue_locked(transfer, pipe))
    }

    fn enqueue_locked(&self, transfer: &Transfer, pipe: &mut Pipe) -> Result<(), Error> {
        self.schedule.lock(|s| {
            let mut s = s.borrow_mut();

            let qh = match pipe.hcdpriv {
                Some(qh) => {
                    s.pools.qh_hw_mut(qh).refresh_address(pipe.device.address, pipe.max_packet_size);
                    qh
                }
                None => {
                    let qh = s.pools.alloc_qh()?;
                    s.pools.qh_hw_mut(qh).configure(QhConfig {
                        device_addr: pipe.device.address,
                        endpoint: pipe.endpoint,
                        speed: pipe.device.speed,
                        max_packet_size: pipe.max_packet_size,
                        is_control: pipe.transfer_type == TransferType::Control,
                        nak_reload: crate::config::EHCI_TRANS_ERRORS,
                    });

                    if pipe.transfer_type == TransferType::Control {
                        // The stack only ever hands this driver a buffer for
                        // the data stage; the SETUP packet's 8 bytes need
                        // their own scratch DMA block, allocated once and
                        // rewritten on every control transfer.
                        let block = s.pools.alloc_scratch(8, 4)?;
                        s.pools.qh_entry_mut(qh).setup = Some(block);
                    }

                    match pipe.transfer_type {
                        TransferType::Interrupt => {
                            let period = period_from_binterval(pipe.device.speed, pipe.interval);
                            s.periodic.link_interrupt(
                                &mut s.pools,
                                period.next_power_of_two().min(crate::config::EHCI_PERIODIC_SIZE as u32),
                                pipe.device.speed,
                                qh,
                            )?;
                        }
                        TransferType::Control | TransferType::Bulk => {
                            s.async_list.link(&mut s.pools, &self.op, qh);
                        }
                    }

                    pipe.hcdpriv = Some(qh);
                    qh
                }
            };

            if s.pools.qh_entry(qh).pending.is_some() {
                // Only one outstanding transfer per pipe at a time; a
                // second submission before the first retires is rejected.
                return Err(Error::InvalidConfiguration);
            }

            let head_qtd = if pipe.transfer_type == TransferType::Control {
                Self::build_control_chain(&mut s.pools, qh, transfer, pipe.max_packet_size)?
            } else {
                if transfer.size == 0 {
                    return Err(Error::InvalidConfiguration);
                }
                let pid = match transfer.direction {
                    Direction::Out => Pid::Out,
                    Direction::In => Pid::In,
                };
                let built = build_qtd(pid, pipe.max_packet_size, transfer.buffer, transfer.size, false).ok_or(Error::InvalidConfiguration)?;

                let qtd = s.pools.alloc_qtd()?;
                *s.pools.qtd_hw_mut(qtd) = built.hw;
                s.pools.qtd_hw_mut(qtd).token = built.hw.token.with_ioc(true);
                s.pools.qtd_entry_mut(qtd).requested = built.bytes_consumed as u16;
                qtd
            };

            let qh_hw = s.pools.qh_hw_mut(qh);
            qh_hw.next_qtd = s.pools.qtd_paddr(head_qtd).raw();
            qh_hw.alt_next_qtd = PhysAddr::INVALID.raw();

            let entry = s.pools.qh_entry_mut(qh);
            entry.last_qtd = Some(head_qtd);
            entry.pending = Some(PendingTransfer {
                head_qtd,
                private: transfer.private,
                finished: transfer.finished,
            });

            crate::dma::barrier();
            Ok(())
        })
    }

    /// Builds the SETUP → (optional DATA) → STATUS qTD chain a control
    /// transfer requires, serializing `transfer.setup` into the QH's scratch
    /// buffer, toggling data-toggle per USB's control-transfer rules (SETUP
    /// always DT=0, the first DATA packet and the STATUS packet always
    /// DT=1), and setting IOC only on the last qTD in the chain. Returns the
    /// chain's head (the SETUP qTD).
    fn build_control_chain(pools: &mut DescriptorPools<'a, A>, qh: QhHandle, transfer: &Transfer, max_packet_size: u16) -> Result<QtdHandle, Error> {
        let setup = transfer.setup.ok_or(Error::InvalidConfiguration)?;

        let setup_phys = pools.qh_entry(qh).setup.as_ref().ok_or(Error::InvalidConfiguration)?.phys;
        let setup_virt = pools.qh_entry(qh).setup.as_ref().ok_or(Error::InvalidConfiguration)?.virt;
        let bytes = setup.to_bytes();
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), setup_virt.as_ptr(), bytes.len()) };
        crate::dma::barrier();

        let setup_qtd = pools.alloc_qtd()?;
        *pools.qtd_hw_mut(setup_qtd) = QtdHw::default();
        pools.qtd_hw_mut(setup_qtd).token = QtdToken::new().with_active(true).with_pid(Pid::Setup as u8).with_data_toggle(false).with_total_bytes(8);
        pools.qtd_hw_mut(setup_qtd).buffer[0] = setup_phys.raw();
        pools.qtd_entry_mut(setup_qtd).requested = 8;

        let has_data = transfer.size > 0;
        let data_qtd = if has_data {
            let data_pid = match transfer.direction {
                Direction::Out => Pid::Out,
                Direction::In => Pid::In,
            };
            let built = build_qtd(data_pid, max_packet_size, transfer.buffer, transfer.size, true).ok_or(Error::InvalidConfiguration)?;
            let h = pools.alloc_qtd()?;
            *pools.qtd_hw_mut(h) = built.hw;
            pools.qtd_entry_mut(h).requested = built.bytes_consumed as u16;
            Some(h)
        } else {
            None
        };

        // No data stage: status is always IN. With a data stage: status
        // runs opposite the data stage's direction.
        let status_pid = match (has_data, transfer.direction) {
            (false, _) => Pid::In,
            (true, Direction::Out) => Pid::In,
            (true, Direction::In) => Pid::Out,
        };
        let status_qtd = pools.alloc_qtd()?;
        *pools.qtd_hw_mut(status_qtd) = QtdHw::default();
        pools.qtd_hw_mut(status_qtd).token = QtdToken::new().with_active(true).with_pid(status_pid as u8).with_data_toggle(true).with_ioc(true);
        pools.qtd_entry_mut(status_qtd).requested = 0;

        let after_setup = data_qtd.unwrap_or(status_qtd);
        pools.qtd_entry_mut(setup_qtd).sibling_next = Some(after_setup);
        pools.qtd_hw_mut(setup_qtd).next = pools.qtd_paddr(after_setup).raw();

        if let Some(d) = data_qtd {
            pools.qtd_entry_mut(d).sibling_next = Some(status_qtd);
            pools.qtd_hw_mut(d).next = pools.qtd_paddr(status_qtd).raw();
        }

        pools.qtd_entry_mut(status_qtd).sibling_next = None;
        pools.qtd_hw_mut(status_qtd).next = PhysAddr::INVALID.raw();

        Ok(setup_qtd)
    }

    /// `usb_transferDequeue`: best-effort cancellation. In-flight
    /// cancellation semantics beyond marking the QH idle again are left to
    /// the roothub/stack layer; this clears the driver's own bookkeeping
    /// so a stale completion can't surface later.
    pub fn transfer_dequeue(&self, _transfer: &Transfer, pipe: &mut Pipe) {
        let Some(qh) = pipe.hcdpriv else { return };
        self.schedule.lock(|s| {
            let mut s = s.borrow_mut();
            s.pools.qh_entry_mut(qh).pending = None;
        });
    }

    /// `usb_pipeDestroy`: unlinks the QH from whichever schedule it was on
    /// and returns every descriptor it owned to the pool.
    pub fn pipe_destroy(&self, pipe: &mut Pipe) {
        let Some(qh) = pipe.hcdpriv.take() else { return };

        self.schedule.lock(|s| {
            let mut s = s.borrow_mut();

            let period = s.pools.qh_entry(qh).period;
            if period != 0 {
                s.periodic.unlink_interrupt(&mut s.pools, qh);
            } else {
                s.async_list.unlink(&mut s.pools, &self.op, qh);
            }

            if let Some(head) = s.pools.qh_entry(qh).last_qtd {
                let mut cur = Some(head);
                while let Some(h) = cur {
                    let next = s.pools.qtd_entry(h).sibling_next;
                    s.pools.release_qtd(h);
                    cur = next;
                }
            }

            s.pools.release_qh(qh);
        });
    }

    /// `usb_getRoothubStatus`, dispatched to `roothub`.
    pub fn get_roothub_status<R: Roothub>(&self, roothub: &R) -> u32 {
        roothub.status()
    }

    fn reap_one(&self, qh: QhHandle, s: &mut Schedule<'a, A>) {
        let Some(head) = s.pools.qh_entry(qh).last_qtd else { return };
        let chain_start = {
            // The first not-yet-retired qTD is the ring's logical head;
            // callers only ever track the tail (`last_qtd`) because a
            // single-outstanding-transfer QH's ring has exactly one chain.
            head
        };

        if let Some(reaped) = crate::reaper::reap_chain(&mut s.pools, qh, chain_start) {
            if let Some(pending) = s.pools.qh_entry_mut(qh).pending.take() {
                let status = match reaped.status {
                    Ok(bytes) => bytes as i32,
                    Err(e) => e.to_status(),
                };
                (pending.finished)(pending.private, status);
            }
        } else if let Some(reaped) = crate::reaper::reap_halted_overlay(&mut s.pools, qh) {
            if let Some(pending) = s.pools.qh_entry_mut(qh).pending.take() {
                let status = match reaped.status {
                    Ok(bytes) => bytes as i32,
                    Err(e) => e.to_status(),
                };
                (pending.finished)(pending.private, status);
            }
        }
    }
}

impl<'a, A: DmaAllocator> StatusHandler for EhciHcd<'a, A> {
    fn handle_status(&self, bits: u32) {
        if irq::is_system_error(bits) {
            // Terminal: no recovery attempted, only surfaced to whoever
            // polls status.
        }

        if irq::is_completion(bits) {
            self.schedule.lock(|s| {
                let mut s = s.borrow_mut();
                let mut qhs: alloc::vec::Vec<QhHandle> = {
                    // Walks the whole ring including the dummy head itself;
                    // reaping the dummy is a no-op since it never carries a
                    // pending transfer.
                    let mut v = alloc::vec::Vec::new();
                    let start = s.async_list.head();
                    let mut cur = start;
                    loop {
                        v.push(cur);
                        cur = s.pools.qh_entry(cur).next.unwrap_or(start);
                        if cur == start {
                            break;
                        }
                    }
                    v
                };
                qhs.extend(s.periodic.linked_qhs(&s.pools));
                for qh in qhs {
                    self.reap_one(qh, &mut *s);
                }
            });
        }

        if irq::is_port_change(bits) {
            // Roothub port-status handling is owned by the generic stack
            // through `get_roothub_status`/`Roothub::dispatch`; this driver
            // only needed to notice the bit and wake the worker, which it
            // already has by virtue of running this handler.
        }
    }
}
