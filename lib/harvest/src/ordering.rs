//! Ordering of file names within one poll cycle.
//!
//! Instrument files are usually named like `unit_1_2_10.dat`, where the
//! underscore separated numbers are sequence counters. A plain byte-wise sort
//! puts `10` before `2`, so names with numbered segments are compared token by
//! token, numerically where both tokens are integers.

use std::cmp::Ordering;

#[derive(Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Token<'a> {
    Number(u64),
    Text(&'a str),
}

fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _extension)) if !stem.is_empty() => stem,
        _ => name,
    }
}

fn tokens(name: &str) -> impl Iterator<Item = Token<'_>> {
    stem(name).split('_').map(|token| match token.parse::<u64>() {
        Ok(number) if token.bytes().all(|b| b.is_ascii_digit()) => Token::Number(number),
        _ => Token::Text(token),
    })
}

/// Whether the name carries at least one `_<digits>` segment.
pub fn has_numbered_segment(name: &str) -> bool {
    stem(name)
        .split('_')
        .skip(1)
        .any(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
}

/// Compare by the composite numeric key, the whole name breaks ties, e.g.
/// `unit_01.dat` and `unit_1.dat`.
pub fn compare_numbered(a: &str, b: &str) -> Ordering {
    tokens(a).cmp(tokens(b)).then_with(|| a.cmp(b))
}

/// Sort items by name. The composite key is used when any name has a numbered
/// segment, plain lexical order otherwise.
pub fn sort_by_name<T, F>(items: &mut [T], name: F)
where
    F: Fn(&T) -> &str,
{
    if items.iter().any(|item| has_numbered_segment(name(item))) {
        items.sort_by(|a, b| compare_numbered(name(a), name(b)));
    } else {
        items.sort_by(|a, b| name(a).cmp(name(b)));
    }
}
