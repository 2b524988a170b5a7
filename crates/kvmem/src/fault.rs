//! Page-fault error-code decoding.
//!
//! On exception 14 the CPU leaves the faulting linear address in CR2 and
//! pushes an error code describing the access. This module gives the code
//! a typed form and a human-readable rendering for the fault diagnostic;
//! the policy (dump and panic — this kernel does no demand paging) lives
//! with the kernel's handler.

use core::fmt;

bitflags::bitflags! {
    /// The page-fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Set when the fault was a protection violation on a present
        /// page; clear when the page was not present.
        const PROTECTION = 1 << 0;
        /// Set for a write access, clear for a read.
        const WRITE      = 1 << 1;
        /// Set when the access originated in user mode.
        const USER       = 1 << 2;
        /// Set when a reserved bit was found set in a paging structure.
        const RESERVED   = 1 << 3;
    }
}

impl FaultCode {
    /// Decode the raw error code, ignoring bits this kernel does not use.
    #[inline]
    pub fn from_err_code(err_code: u32) -> Self {
        Self::from_bits_truncate(err_code)
    }
}

/// Renders like `present write user-mode`, mirroring the words the fault
/// diagnostic prints before the faulting address.
impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.contains(Self::PROTECTION) {
            "present "
        } else {
            "non-present "
        })?;
        f.write_str(if self.contains(Self::WRITE) {
            "write "
        } else {
            "read "
        })?;
        f.write_str(if self.contains(Self::USER) {
            "user-mode "
        } else {
            "supervisor-mode "
        })?;
        if self.contains(Self::RESERVED) {
            f.write_str("reserved ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_four_architectural_bits() {
        let code = FaultCode::from_err_code(0b0111);
        assert!(code.contains(FaultCode::PROTECTION));
        assert!(code.contains(FaultCode::WRITE));
        assert!(code.contains(FaultCode::USER));
        assert!(!code.contains(FaultCode::RESERVED));
    }

    #[test]
    fn ignores_bits_outside_the_decoded_set() {
        // Instruction-fetch (bit 4) and upper bits are out of scope here.
        let code = FaultCode::from_err_code(0xFFF0);
        assert_eq!(code, FaultCode::empty());
    }

    #[test]
    fn display_matches_the_diagnostic_vocabulary() {
        let code = FaultCode::from_err_code(0b0011);
        assert_eq!(format!("{code}"), "present write supervisor-mode ");
        let code = FaultCode::from_err_code(0);
        assert_eq!(format!("{code}"), "non-present read supervisor-mode ");
    }
}
