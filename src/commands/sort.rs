//! The sort command.

use async_trait::async_trait;
use std::cmp::Ordering;

use super::{Command, CommandIo, read_all_input, wants_help};
use crate::Result;

/// `sort [-r] [-n] [-u] [FILE...]` — sort input lines.
pub struct Sort;

#[async_trait]
impl Command for Sort {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn usage(&self) -> &'static str {
        "usage: sort [-r] [-n] [-u] [FILE...]\nSort the input lines.\n  -r  reverse the order\n  -n  compare numerically (non-numeric lines sort first)\n  -u  drop duplicate lines"
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut reverse = false;
        let mut numeric = false;
        let mut unique = false;
        let mut files = Vec::new();
        for arg in args {
            match arg.as_str() {
                "-r" => reverse = true,
                "-n" => numeric = true,
                "-u" => unique = true,
                _ => files.push(arg.clone()),
            }
        }

        let text = read_all_input(io, &files).await?;
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort_by(|a, b| compare_lines(a, b, numeric));
        if unique {
            lines.dedup();
        }
        if reverse {
            lines.reverse();
        }

        for line in lines {
            io.stdout.write_all(format!("{}\n", line).as_bytes()).await?;
        }
        Ok(0)
    }
}

/// Line comparison: lexicographic, or numeric when requested. Under `-n`,
/// lines without a leading number sort before numeric ones and compare
/// lexicographically among themselves.
fn compare_lines(a: &str, b: &str, numeric: bool) -> Ordering {
    if !numeric {
        return a.cmp(b);
    }
    match (leading_number(a), leading_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal).then(a.cmp(b)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Parses the leading number of a line (after optional whitespace), the way
/// numeric sort keys work: `"  42 apples"` keys on 42.
fn leading_number(line: &str) -> Option<f64> {
    let trimmed = line.trim_start();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start {
        return None;
    }
    trimmed[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::run;
    use super::*;

    #[tokio::test]
    async fn test_sort_lexicographic() {
        let (code, out, _) = run(&Sort, &[], "banana\napple\ncherry\n").await;
        assert_eq!(code, 0);
        assert_eq!(out, "apple\nbanana\ncherry\n");
    }

    #[tokio::test]
    async fn test_sort_reverse() {
        let (_, out, _) = run(&Sort, &["-r"], "a\nc\nb\n").await;
        assert_eq!(out, "c\nb\na\n");
    }

    #[tokio::test]
    async fn test_sort_numeric() {
        let (_, out, _) = run(&Sort, &["-n"], "10\n2\n33\n").await;
        assert_eq!(out, "2\n10\n33\n");
    }

    #[tokio::test]
    async fn test_sort_numeric_non_numeric_first() {
        let (_, out, _) = run(&Sort, &["-n"], "5\nbanana\n2\napple\n").await;
        assert_eq!(out, "apple\nbanana\n2\n5\n");
    }

    #[tokio::test]
    async fn test_sort_unique() {
        let (_, out, _) = run(&Sort, &["-u"], "b\na\nb\na\n").await;
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn test_sort_numeric_with_suffix_keys() {
        // The leading number is the key, as with counted uniq output.
        let (_, out, _) = run(&Sort, &["-n"], "  3 c\n  1 a\n 10 b\n").await;
        assert_eq!(out, "  1 a\n  3 c\n 10 b\n");
    }

    #[test]
    fn test_leading_number_forms() {
        assert_eq!(leading_number("42"), Some(42.0));
        assert_eq!(leading_number("  -3.5 rest"), Some(-3.5));
        assert_eq!(leading_number("+7"), Some(7.0));
        assert_eq!(leading_number("abc"), None);
        assert_eq!(leading_number("-"), None);
    }
}
