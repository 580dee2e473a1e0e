//! Errors returned by the table builder and activation.

use crate::arena::OutOfMemory;

/// Everything that can go wrong while building, mutating or activating a translation table.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlatError {
    /// The request itself is malformed: misaligned or empty region, an address beyond what the
    /// regime can express, or a mutation over memory that isn't mapped.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The page arena ran dry. Nothing the call touched has been left behind.
    #[error("Out of resources: page arena exhausted")]
    OutOfResources,
    /// The hardware didn't keep what we wrote to it (usually a clamped table depth).
    #[error("Configuration unsupported: {register} read back {actual:#x}, expected {expected:#x}")]
    ConfigurationUnsupported {
        /// The register that failed read-back.
        register: &'static str,
        /// What was written (after masking to the verified bits).
        expected: u64,
        /// What came back.
        actual: u64,
    },
    /// An entry decoded to something that is neither invalid, a block nor a table.
    #[error("Corrupted translation entry {raw:#x} at level {level}, index {index}")]
    CorruptedState {
        /// Table level, 0 being the root.
        level: usize,
        /// Index of the entry inside its table.
        index: usize,
        /// The raw descriptor.
        raw: u64,
    },
}

impl XlatError {
    /// Returns true if the error means the tables can no longer be trusted.
    ///
    /// Carrying on after this risks handing out the wrong permissions, so callers should halt.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, XlatError::CorruptedState { .. })
    }
}

impl From<OutOfMemory> for XlatError {
    fn from(_: OutOfMemory) -> Self {
        XlatError::OutOfResources
    }
}

/// Result alias used across the crate.
pub type XlatResult<T> = Result<T, XlatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_corruption_is_fatal() {
        let cases = [
            (XlatError::InvalidParameter("x"), false),
            (XlatError::OutOfResources, false),
            (
                XlatError::ConfigurationUnsupported {
                    register: "TCR_EL1",
                    expected: 16,
                    actual: 25,
                },
                false,
            ),
            (
                XlatError::CorruptedState {
                    level: 0,
                    index: 1,
                    raw: 3,
                },
                true,
            ),
        ];
        for (err, fatal) in cases {
            assert_eq!(err.is_fatal(), fatal, "Failed for {:?}", err);
        }
    }

    #[test]
    fn arena_exhaustion_maps_to_out_of_resources() {
        assert_eq!(XlatError::from(OutOfMemory), XlatError::OutOfResources);
    }
}
