//! Capacity error classification.

/// Provider error fragments that mean "this placement is out of capacity,
/// another one may work".
const CAPACITY_MARKERS: &[&str] = &[
    "location disabled",
    "resource unavailable",
    "resource_unavailable",
    "unsupported location",
    "out of stock",
    "out_of_stock",
    "not available in zone",
];

/// Returns true when `message` reports a capacity or location problem.
///
/// Matching is case-insensitive. This is the only place that inspects
/// provider error text; everything else treats a `false` answer as fatal.
#[must_use]
pub fn is_capacity_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CAPACITY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
