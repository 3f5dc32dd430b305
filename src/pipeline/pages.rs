//! Page-range expressions for PDF split, e.g. `"1-3, 7"`.
//!
//! Tokens are comma-separated. `a-b` is clamped to the document and kept when
//! `start <= end`; a lone number must name an existing page. Tokens that are
//! neither are skipped. Numbers are read from their leading digits, so
//! `"3rd"` means page 3.

use crate::error::KilnError;
use once_cell::sync::Lazy;
use regex::Regex;

static RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)$").unwrap());

/// An inclusive, 1-based run of pages that becomes one output document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
    /// Filename fragment, `pages-2-5` or `page-7`.
    pub label: String,
}

impl PageRange {
    pub fn page_count(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

/// Parse `input` against a document of `total` pages. Never fails; may be empty.
pub fn parse_ranges(input: &str, total: usize) -> Vec<PageRange> {
    let total = u32::try_from(total).unwrap_or(u32::MAX);
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|token| {
            if let Some(caps) = RANGE.captures(token) {
                let start = parse_u32(&caps[1])?.max(1);
                let end = parse_u32(&caps[2])?.min(total);
                (start <= end).then(|| PageRange {
                    start,
                    end,
                    label: format!("pages-{start}-{end}"),
                })
            } else {
                let n = leading_number(token)?;
                (1..=total).contains(&n).then(|| PageRange {
                    start: n,
                    end: n,
                    label: format!("page-{n}"),
                })
            }
        })
        .collect()
}

/// Like [`parse_ranges`], but an empty result is an error.
pub fn require_ranges(input: &str, total: usize) -> Result<Vec<PageRange>, KilnError> {
    let ranges = parse_ranges(input, total);
    if ranges.is_empty() {
        return Err(KilnError::InvalidPageRanges {
            input: input.to_string(),
            total,
        });
    }
    Ok(ranges)
}

// Saturate instead of failing on absurdly long digit runs.
fn parse_u32(digits: &str) -> Option<u32> {
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse().unwrap_or(u32::MAX))
}

fn leading_number(token: &str) -> Option<u32> {
    let end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    parse_u32(&token[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(input: &str, total: usize) -> Vec<(u32, u32)> {
        parse_ranges(input, total).iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn range_and_single() {
        let r = parse_ranges("1-3,7", 10);
        assert_eq!(r.len(), 2);
        assert_eq!((r[0].page_count(), r[1].page_count()), (3, 1));
        assert_eq!(r[0].label, "pages-1-3");
        assert_eq!(r[1].label, "page-7");
    }

    #[test]
    fn ranges_are_clamped() {
        assert_eq!(spans("0-4, 8 - 20", 10), [(1, 4), (8, 10)]);
    }

    #[test]
    fn invalid_tokens_are_skipped() {
        assert_eq!(spans("5-2, 11, abc, , 0, 3", 10), [(3, 3)]);
    }

    #[test]
    fn leading_digits_count() {
        assert_eq!(spans("2nd", 10), [(2, 2)]);
    }

    #[test]
    fn order_and_overlap_are_kept() {
        assert_eq!(spans("4-5,1-2,4", 5), [(4, 5), (1, 2), (4, 4)]);
    }

    #[test]
    fn empty_result_is_an_error() {
        let err = require_ranges("20-30", 10).unwrap_err();
        assert!(matches!(err, KilnError::InvalidPageRanges { total: 10, .. }));
    }

    #[test]
    fn huge_numbers_saturate() {
        assert_eq!(spans("3-99999999999999", 4), [(3, 4)]);
    }
}
