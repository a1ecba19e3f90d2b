use tgbridge_core::BridgeError;

/// Parse a single-range `Range` header against a file of `size` bytes,
/// returning the inclusive `(from, until)` interval.
///
/// Accepted forms are `bytes=a-b`, `bytes=a-` and `bytes=-s`. Multi-range
/// requests and anything out of bounds are unsatisfiable; so is any range
/// against an empty file.
pub fn parse_range_header(value: &str, size: u64) -> Result<(u64, u64), BridgeError> {
    let unsatisfiable = || BridgeError::RangeNotSatisfiable { size };

    let spec = value.strip_prefix("bytes=").ok_or_else(unsatisfiable)?;
    if spec.contains(',') {
        return Err(unsatisfiable());
    }
    if size == 0 {
        return Err(unsatisfiable());
    }

    let (start_str, end_str) = spec.split_once('-').ok_or_else(unsatisfiable)?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    match (start_str.is_empty(), end_str.is_empty()) {
        // bytes=-s : the last s bytes.
        (true, false) => {
            let suffix: u64 = end_str.parse().map_err(|_| unsatisfiable())?;
            if suffix == 0 {
                return Err(unsatisfiable());
            }
            Ok((size.saturating_sub(suffix), size - 1))
        }
        // bytes=a- : from a to the end.
        (false, true) => {
            let from: u64 = start_str.parse().map_err(|_| unsatisfiable())?;
            if from >= size {
                return Err(unsatisfiable());
            }
            Ok((from, size - 1))
        }
        // bytes=a-b : inclusive interval.
        (false, false) => {
            let from: u64 = start_str.parse().map_err(|_| unsatisfiable())?;
            let until: u64 = end_str.parse().map_err(|_| unsatisfiable())?;
            if from > until || from >= size || until >= size {
                return Err(unsatisfiable());
            }
            Ok((from, until))
        }
        (true, true) => Err(unsatisfiable()),
    }
}
