//! Usage-vector validation shared by admission, buffer retirement, and the
//! persisted ledger.

use crate::error::AdmissionError;

/// Validate a requested-usage vector has exactly `dims` entries.
///
/// Negative values cannot occur since usage is `u64`; the Python
/// original's separate negative-value check (`0 > min(resources)`) is
/// therefore subsumed by the type itself (see DESIGN.md's resolution of
/// this Open Question).
pub(crate) fn check_length(usage: &[u64], dims: usize) -> Result<(), AdmissionError> {
    if usage.len() != dims {
        return Err(AdmissionError::WrongLength {
            expected: dims,
            actual: usage.len(),
        });
    }
    Ok(())
}
