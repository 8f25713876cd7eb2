#![forbid(unsafe_code)]

use std::cmp::Ordering;

/// Compare two dotted version strings component-wise. Missing components
/// are treated as zero, so `2` and `2.0.0` are equal. Non-numeric
/// characters after the leading digits of a component are ignored
/// (`1.2.3-rc1` compares as `1.2.3`).
pub fn compare(a: &str, b: &str) -> Ordering {
    let a: Vec<u64> = components(a);
    let b: Vec<u64> = components(b);
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `latest` is strictly newer than `installed`.
pub fn is_newer(latest: &str, installed: &str) -> bool {
    compare(latest, installed) == Ordering::Greater
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
