//! printf-style numeric filename patterns
//!
//! Posterior and weight maps are written one file per label or atlas, named
//! by substituting the index into a pattern such as `posterior%04d.nii.gz`.
//! Supported conversions: `%d`, `%i`, `%u` with optional `0` flag and width,
//! and the `%%` escape.

use crate::error::{FusionError, Result};

/// Substitute `index` for every integer conversion in `pattern`
pub fn format_index(pattern: &str, index: i64) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        // Collect flags and width
        let mut spec = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '-' {
                spec.push(d);
                chars.next();
            } else {
                break;
            }
        }

        match chars.peek() {
            Some('d') | Some('i') | Some('u') => {
                chars.next();
                let left = spec.starts_with('-');
                let spec = spec.trim_start_matches('-');
                let zero = spec.starts_with('0');
                let width: usize = spec.parse().unwrap_or(0);
                let formatted = if left {
                    format!("{:<width$}", index, width = width)
                } else if zero {
                    format!("{:0width$}", index, width = width)
                } else {
                    format!("{:width$}", index, width = width)
                };
                out.push_str(&formatted);
            }
            _ => {
                // Not an integer conversion: keep verbatim
                out.push('%');
                out.push_str(&spec);
            }
        }
    }

    out
}

/// Fail when the pattern does not vary with the substituted index
pub fn validate_pattern(pattern: &str) -> Result<()> {
    let sentinel = format_index(pattern, 100);
    if sentinel == pattern || sentinel == format_index(pattern, 101) {
        return Err(FusionError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_index() {
        assert_eq!(format_index("posterior%04d.nii.gz", 7), "posterior0007.nii.gz");
        assert_eq!(format_index("w%d.nii", 12), "w12.nii");
        assert_eq!(format_index("w%3i.nii", 5), "w  5.nii");
        assert_eq!(format_index("p%%_%02d", 3), "p%_03");
        assert_eq!(format_index("lab%d_%d", 4), "lab4_4");
        assert_eq!(format_index("neg%03d", -2), "neg-02");
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("posterior%04d.nii.gz").is_ok());
        assert!(validate_pattern("posterior.nii.gz").is_err());
        assert!(validate_pattern("posterior%%.nii.gz").is_err());
        assert!(validate_pattern("posterior%s.nii.gz").is_err());
    }
}
