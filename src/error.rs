//! Error taxonomy shared by every fallible operation in the crate.

/// Driver-level error, returned by the internal `Result`-typed API.
///
/// The `hcd_ops` boundary (see [`crate::stack`]) converts these into the
/// negative `i32` status codes the upward C-shaped interface expects; no
/// panic or unwind ever crosses that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Descriptor or control-block allocation failed.
    OutOfMemory,
    /// Unaligned register base, or a submission that would produce zero
    /// qTDs.
    InvalidConfiguration,
    /// A qTD completed with XACT, BABBLE or BUFERR set. Carries the number
    /// of qTDs in the ring that reported an error.
    TransactionError(u8),
    /// The QH's overlay token reported the halted bit.
    Halted,
    /// USBSTS.SEI fired. Terminal for the controller; no recovery in scope.
    SystemError,
    /// A register handshake (HCRESET, schedule enable/disable) didn't
    /// complete within its deadline.
    Timeout,
}

impl Error {
    /// Negative status code reported through `usb_transferFinished`, or as
    /// an `init` return value.
    pub fn to_status(self) -> i32 {
        match self {
            Error::OutOfMemory => -12,          // ENOMEM
            Error::InvalidConfiguration => -22, // EINVAL
            Error::TransactionError(count) => -(count.max(1) as i32),
            Error::Halted => -32,   // EPIPE
            Error::SystemError => -5, // EIO
            Error::Timeout => -110,   // ETIMEDOUT
        }
    }
}
