//! Exit-code retryability for the `ExitCode` restart policy.

use std::ops::RangeInclusive;
use std::str::FromStr;

/// Set of exit codes whose failure is worth recreating the unit for.
///
/// Parsed from a comma-separated list of codes and inclusive ranges,
/// e.g. `"1,128-255"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableExitCodes {
    ranges: Vec<RangeInclusive<i32>>,
}

impl RetryableExitCodes {
    pub fn new(ranges: Vec<RangeInclusive<i32>>) -> Self {
        Self { ranges }
    }

    pub fn is_retryable(&self, code: i32) -> bool {
        self.ranges.iter().any(|r| r.contains(&code))
    }
}

impl Default for RetryableExitCodes {
    /// Codes 128-255: termination by a signal, typically preemption or OOM kill.
    fn default() -> Self {
        Self::new(vec![128..=255])
    }
}

impl FromStr for RetryableExitCodes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_code(lo)?;
                    let hi = parse_code(hi)?;
                    if lo > hi {
                        return Err(format!("empty exit code range '{part}'"));
                    }
                    lo..=hi
                }
                None => {
                    let code = parse_code(part)?;
                    code..=code
                }
            };
            ranges.push(range);
        }
        Ok(Self::new(ranges))
    }
}

fn parse_code(s: &str) -> Result<i32, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid exit code '{}'", s.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, false)]
    #[case(127, false)]
    #[case(128, true)]
    #[case(130, true)]
    #[case(137, true)]
    #[case(255, true)]
    #[case(256, false)]
    fn test_default_set(#[case] code: i32, #[case] retryable: bool) {
        assert_eq!(RetryableExitCodes::default().is_retryable(code), retryable);
    }

    #[test]
    fn test_parse_list_and_ranges() {
        let codes: RetryableExitCodes = "1, 3-5 ,137".parse().unwrap();
        assert!(codes.is_retryable(1));
        assert!(!codes.is_retryable(2));
        assert!(codes.is_retryable(4));
        assert!(codes.is_retryable(137));
        assert!(!codes.is_retryable(138));
    }

    #[test]
    fn test_parse_default_form() {
        let codes: RetryableExitCodes = "128-255".parse().unwrap();
        assert_eq!(codes, RetryableExitCodes::default());
    }

    #[test]
    fn test_parse_empty_is_nothing_retryable() {
        let codes: RetryableExitCodes = "".parse().unwrap();
        assert!(!codes.is_retryable(137));
    }

    #[test]
    fn test_parse_errors() {
        assert!("abc".parse::<RetryableExitCodes>().is_err());
        assert!("10-2".parse::<RetryableExitCodes>().is_err());
        assert!("1-x".parse::<RetryableExitCodes>().is_err());
    }
}
