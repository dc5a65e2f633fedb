//! Build-time configuration.
//!
//! Mirrors the Cargo feature / per-family `Config`-style knobs a clock-tree
//! module would expose, but for schedule-manager tuning instead of clocks.

/// Frame-list size, selected by the `periodic-128` / `periodic-1024` Cargo
/// features. Exactly one must be enabled; `periodic-128` wins if both are
/// (the embedded target is the minority case worth being explicit about).
#[cfg(feature = "periodic-128")]
pub const EHCI_PERIODIC_SIZE: usize = 128;
#[cfg(not(feature = "periodic-128"))]
pub const EHCI_PERIODIC_SIZE: usize = 1024;

/// Worker task priority. Only meaningful on targets with a real scheduler;
/// `embassy_executor::task` on a single-priority cooperative executor
/// ignores it, but the constant stays so the value is visible and can be
/// threaded through a `k_thread`-style scheduler on targets that have one.
pub const EHCI_PRIO: u8 = 6;

/// Maximum number of qTDs cached on the free list.
pub const EHCI_MAX_QTD_POOL: usize = 32;

/// Maximum number of QHs cached on the free list.
pub const EHCI_MAX_QH_POOL: usize = 16;

/// Buffer pointers per qTD/QH overlay.
pub const EHCI_QH_NBUFS: usize = 5;

/// EHCI hardware page size for qTD buffer-pointer splitting.
pub const EHCI_PAGE_SIZE: usize = 4096;

/// Error-retry count loaded into a QH's NAK-count-reload field.
pub const EHCI_TRANS_ERRORS: u8 = 3;

/// `true` when the `imx-rt`-style embedded register layout/barrier variant
/// is selected instead of the generic PCI-discovered EHCI layout.
pub const EHCI_IMX: bool = cfg!(feature = "imx-rt");
