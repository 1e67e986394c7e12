//! Alignment helpers.

/// Round `value` up to a multiple of `alignment`.
///
/// `alignment` must be a power of two; zero is treated as one.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment`.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value & !(alignment - 1)
}

/// Whether `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment <= 1 || value & (alignment - 1) == 0
}

/// Format a byte count for reports, e.g. `1.50 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
