//! Strict parsers for the small configuration grammars the library accepts:
//! decimal/hex integers, comma-separated lists, inclusive ranges, and
//! bracketed groups used to express monitoring-group ordering. Anything
//! outside the grammar is rejected; there is no lenient fallback.

use crate::error::{RdtError, Result};

/// Parses a decimal (`123`) or hex (`0x7b`/`0X7B`) unsigned integer.
pub fn parse_uint(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|_| RdtError::param(format!("not a valid hex number: {s}")))
    } else {
        s.parse::<u64>()
            .map_err(|_| RdtError::param(format!("not a valid decimal number: {s}")))
    }
}

/// Parses an inclusive range `a-b`. Swaps the bounds if `a > b` so the
/// result is always ascending, matching the source behaviour.
pub fn parse_range(s: &str) -> Result<(u64, u64)> {
    let s = s.trim();
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| RdtError::param(format!("not a range: {s}")))?;
    let a = parse_uint(a)?;
    let b = parse_uint(b)?;
    Ok(if a <= b { (a, b) } else { (b, a) })
}

/// Parses a comma-separated list of values and/or ranges (`1,3-5,8`) into
/// an ascending, de-duplicated id list.
pub fn parse_id_list(s: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(RdtError::param("empty element in list"));
        }
        if part.contains('-') {
            let (a, b) = parse_range(part)?;
            for v in a..=b {
                ids.push(v as u32);
            }
        } else {
            ids.push(parse_uint(part)? as u32);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Parses a bracketed group list used for monitoring ordering, e.g.
/// `"[1,2,3][4,5]"` becomes `[[1,2,3],[4,5]]`. Each group is itself an id
/// list per [`parse_id_list`].
pub fn parse_bracketed_groups(s: &str) -> Result<Vec<Vec<u32>>> {
    let mut groups = Vec::new();
    let mut rest = s.trim();
    if rest.is_empty() {
        return Err(RdtError::param("empty group list"));
    }
    while !rest.is_empty() {
        let body = rest
            .strip_prefix('[')
            .ok_or_else(|| RdtError::param(format!("expected '[' at: {rest}")))?;
        let (inner, tail) = body
            .split_once(']')
            .ok_or_else(|| RdtError::param(format!("unterminated group: {rest}")))?;
        groups.push(parse_id_list(inner)?);
        rest = tail.trim();
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_and_hex() {
        assert_eq!(parse_uint("42").unwrap(), 42);
        assert_eq!(parse_uint("0xFF").unwrap(), 255);
        assert!(parse_uint("abc").is_err());
    }

    #[test]
    fn range_swaps_reversed_bounds() {
        assert_eq!(parse_range("2-5").unwrap(), (2, 5));
        assert_eq!(parse_range("5-2").unwrap(), (2, 5));
    }

    #[test]
    fn id_list_dedups_and_sorts() {
        assert_eq!(parse_id_list("3,1,1-2").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn bracketed_groups() {
        let groups = parse_bracketed_groups("[1,2,3][4,5]").unwrap();
        assert_eq!(groups, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_id_list("1,,2").is_err());
        assert!(parse_bracketed_groups("1,2").is_err());
    }
}
