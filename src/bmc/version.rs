// src/bmc/version.rs

//! Dell-style dotted firmware version comparison: component-wise numeric
//! compare with zero-padding for mismatched lengths, falling back to a
//! plain string compare when a component isn't numeric.

/// Returns `true` if `new_version` is newer than `current_version`.
///
/// Splits each string on `.`, keeps only numeric components, zero-pads the
/// shorter side, and compares component-wise. Falls back to a plain string
/// comparison if either side yields no numeric components at all.
pub fn is_newer(new_version: &str, current_version: &str) -> bool {
    if new_version.is_empty() || current_version.is_empty() {
        return false;
    }
    if new_version == current_version {
        return false;
    }

    let new_parts = numeric_parts(new_version);
    let cur_parts = numeric_parts(current_version);

    if new_parts.is_empty() || cur_parts.is_empty() {
        return new_version > current_version;
    }

    let max_len = new_parts.len().max(cur_parts.len());
    for i in 0..max_len {
        let n = new_parts.get(i).copied().unwrap_or(0);
        let c = cur_parts.get(i).copied().unwrap_or(0);
        if n > c {
            return true;
        }
        if n < c {
            return false;
        }
    }
    false
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .filter_map(|p| p.parse::<u64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_newer_patch_version() {
        assert!(is_newer("2.15.2", "2.15.1"));
        assert!(!is_newer("2.15.1", "2.15.2"));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!is_newer("1.2.3", "1.2.3"));
    }

    #[test]
    fn pads_shorter_version_with_zeros() {
        assert!(is_newer("2.1", "2.0.9"));
        assert!(!is_newer("2.0", "2.0.1"));
    }

    #[test]
    fn falls_back_to_string_comparison_for_non_numeric() {
        assert!(is_newer("B", "A"));
    }

    #[test]
    fn empty_versions_are_never_newer() {
        assert!(!is_newer("", "1.0.0"));
        assert!(!is_newer("1.0.0", ""));
    }
}
