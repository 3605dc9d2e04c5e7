//! Capacity-range resolution for create and expand calls.

use crate::csi;

/// Bytes per GiB.
pub const BYTES_PER_GIB: i64 = 1 << 30;
/// Size used when the caller does not ask for a specific capacity: 10 GiB.
pub const DEFAULT_VOLUME_SIZE: i64 = 10 * BYTES_PER_GIB;

const _: () = assert!(DEFAULT_VOLUME_SIZE > 0);

/// Turn an optional capacity range into one concrete size in bytes.
///
/// `required_bytes` (if positive) replaces the default, then `limit_bytes`
/// (if positive and smaller) clamps the result down. When both are set and
/// `required_bytes > limit_bytes`, the limit wins.
pub fn resolve(range: Option<&csi::CapacityRange>) -> i64 {
    let Some(range) = range else {
        return DEFAULT_VOLUME_SIZE;
    };

    let mut size = DEFAULT_VOLUME_SIZE;
    if range.required_bytes > 0 {
        size = range.required_bytes;
    }
    if range.limit_bytes > 0 && range.limit_bytes < size {
        size = range.limit_bytes;
    }

    debug_assert!(size > 0, "resolved size must be positive");
    size
}
