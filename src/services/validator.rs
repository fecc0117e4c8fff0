//! EPC format validation
//!
//! Length-only check; full GS1 header/partition decoding is not attempted.

/// Required EPC length in characters (96-bit EPC as hex)
pub const EPC_LENGTH: usize = 24;

/// True iff the EPC is exactly `EPC_LENGTH` characters long
#[inline]
pub fn validate_epc(epc: &str) -> bool {
    epc.chars().count() == EPC_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_exactly_24_chars() {
        assert!(validate_epc("AAAAAAAAAAAAAAAAAAAAAAAA"));
        assert!(validate_epc("000000000000000000000001"));
    }

    #[test]
    fn test_rejects_other_lengths() {
        for len in [0, 1, 23, 25, 26, 48] {
            let epc = "A".repeat(len);
            assert!(!validate_epc(&epc), "length {len} should be rejected");
        }
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        // 24 characters, more than 24 bytes
        assert!(validate_epc(&"é".repeat(24)));
        assert!(!validate_epc(&"é".repeat(12)));
    }
}
