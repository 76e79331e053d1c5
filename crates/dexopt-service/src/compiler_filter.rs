//! Compiler filter names and their ordering

/// Filter that means "do not dexopt"
pub const NOOP: &str = "skip";

/// Known filters from least to most aggressive
const ORDERED: [&str; 9] = [
    "assume-verified",
    "extract",
    "verify",
    "space-profile",
    "space",
    "speed-profile",
    "speed",
    "everything-profile",
    "everything",
];

fn rank(filter: &str) -> Option<usize> {
    ORDERED.iter().position(|f| *f == filter)
}

/// Whether `filter` names a real compiler filter or the no-op filter
pub fn is_valid(filter: &str) -> bool {
    filter == NOOP || rank(filter).is_some()
}

/// Whether `filter` needs a profile
pub fn is_profile_guided(filter: &str) -> bool {
    matches!(filter, "space-profile" | "speed-profile" | "everything-profile")
}

/// Whether `filter` produces AOT-compiled code
pub fn is_optimized(filter: &str) -> bool {
    match (rank(filter), rank("verify")) {
        (Some(r), Some(verify)) => r > verify,
        _ => false,
    }
}

/// The filter to use for apps whose compiled code the runtime ignores
pub fn safe_mode_filter(filter: &str) -> &str {
    if is_optimized(filter) {
        "verify"
    } else {
        filter
    }
}

/// Whether `a` is strictly better than `b`. Unknown filters compare as not better.
pub fn is_better(a: &str, b: &str) -> bool {
    match (rank(a), rank(b)) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}
