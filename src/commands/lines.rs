//! Line-window commands: head, tail, uniq, nl.

use async_trait::async_trait;
use std::collections::VecDeque;

use super::{Command, CommandIo, complain, wants_help};
use crate::Result;

/// Parses `-n N` (or `-nN`) from the argument list, returning the count and
/// the remaining positional arguments.
fn parse_count(
    args: &[String],
    default: usize,
) -> std::result::Result<(usize, Vec<String>), String> {
    let mut count = default;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-n" {
            let value = iter.next().ok_or("-n requires a count")?;
            count = value
                .parse()
                .map_err(|_| format!("invalid count {:?}", value))?;
        } else if let Some(value) = arg.strip_prefix("-n") {
            count = value
                .parse()
                .map_err(|_| format!("invalid count {:?}", value))?;
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((count, rest))
}

/// `head [-n N]` — first N lines (default 10).
pub struct Head;

#[async_trait]
impl Command for Head {
    fn name(&self) -> &'static str {
        "head"
    }

    fn usage(&self) -> &'static str {
        "usage: head [-n N]\nPrint the first N lines of the input (default 10)."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let (count, _) = match parse_count(args, 10) {
            Ok(parsed) => parsed,
            Err(msg) => {
                complain(io, "head", &msg).await?;
                return Ok(2);
            }
        };

        let mut emitted = 0usize;
        while emitted < count {
            let line = io.stdin.read_line_bytes().await?;
            if line.is_empty() {
                break;
            }
            io.stdout.write_all(&line).await?;
            emitted += 1;
        }
        Ok(0)
    }
}

/// `tail [-n N]` — last N lines (default 10).
pub struct Tail;

#[async_trait]
impl Command for Tail {
    fn name(&self) -> &'static str {
        "tail"
    }

    fn usage(&self) -> &'static str {
        "usage: tail [-n N]\nPrint the last N lines of the input (default 10)."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let (count, _) = match parse_count(args, 10) {
            Ok(parsed) => parsed,
            Err(msg) => {
                complain(io, "tail", &msg).await?;
                return Ok(2);
            }
        };

        let mut window: VecDeque<Vec<u8>> = VecDeque::with_capacity(count + 1);
        loop {
            let line = io.stdin.read_line_bytes().await?;
            if line.is_empty() {
                break;
            }
            window.push_back(line);
            if window.len() > count {
                window.pop_front();
            }
        }
        for line in window {
            io.stdout.write_all(&line).await?;
        }
        Ok(0)
    }
}

/// `uniq [-c]` — collapse adjacent duplicate lines.
pub struct Uniq;

#[async_trait]
impl Command for Uniq {
    fn name(&self) -> &'static str {
        "uniq"
    }

    fn usage(&self) -> &'static str {
        "usage: uniq [-c]\nCollapse adjacent duplicate lines. -c prefixes each line with its count."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let counted = args.iter().any(|a| a == "-c");
        let mut current: Option<(String, u64)> = None;

        loop {
            let raw = io.stdin.read_line_bytes().await?;
            let line = if raw.is_empty() {
                None
            } else {
                let text = String::from_utf8_lossy(&raw);
                Some(text.strip_suffix('\n').unwrap_or(&text).to_string())
            };

            match (&mut current, line) {
                (Some((prev, n)), Some(line)) if *prev == line => *n += 1,
                (slot, line) => {
                    if let Some((prev, n)) = slot.take() {
                        emit_uniq(io, counted, &prev, n).await?;
                    }
                    match line {
                        Some(line) => *slot = Some((line, 1)),
                        None => return Ok(0),
                    }
                }
            }
        }
    }
}

async fn emit_uniq(io: &CommandIo, counted: bool, line: &str, n: u64) -> Result<()> {
    let out = if counted {
        format!("{:>7} {}\n", n, line)
    } else {
        format!("{}\n", line)
    };
    io.stdout.write_all(out.as_bytes()).await?;
    Ok(())
}

/// `nl` — number non-empty lines.
pub struct Nl;

#[async_trait]
impl Command for Nl {
    fn name(&self) -> &'static str {
        "nl"
    }

    fn usage(&self) -> &'static str {
        "usage: nl\nNumber the non-empty input lines, right-aligned in a six-column field."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut number = 0u64;
        loop {
            let raw = io.stdin.read_line_bytes().await?;
            if raw.is_empty() {
                return Ok(0);
            }
            let text = String::from_utf8_lossy(&raw);
            let body = text.strip_suffix('\n').unwrap_or(&text);
            if body.is_empty() {
                io.stdout.write_all(b"\n").await?;
            } else {
                number += 1;
                io.stdout
                    .write_all(format!("{:>6}\t{}\n", number, body).as_bytes())
                    .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::run;
    use super::*;

    #[tokio::test]
    async fn test_head_default_and_explicit() {
        let input: String = (1..=20).map(|i| format!("{}\n", i)).collect();
        let (code, out, _) = run(&Head, &[], &input).await;
        assert_eq!(code, 0);
        assert_eq!(out.lines().count(), 10);
        assert!(out.starts_with("1\n"));

        let (_, out, _) = run(&Head, &["-n", "3"], &input).await;
        assert_eq!(out, "1\n2\n3\n");
    }

    #[tokio::test]
    async fn test_tail_keeps_last_lines() {
        let input: String = (1..=20).map(|i| format!("{}\n", i)).collect();
        let (_, out, _) = run(&Tail, &["-n", "2"], &input).await;
        assert_eq!(out, "19\n20\n");
    }

    #[tokio::test]
    async fn test_tail_shorter_than_window() {
        let (_, out, _) = run(&Tail, &["-n", "5"], "a\nb\n").await;
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn test_uniq_collapses_adjacent() {
        let (_, out, _) = run(&Uniq, &[], "a\na\nb\na\n").await;
        assert_eq!(out, "a\nb\na\n");
    }

    #[tokio::test]
    async fn test_uniq_counted() {
        let (_, out, _) = run(&Uniq, &["-c"], "a\na\na\nb\n").await;
        assert_eq!(out, format!("{:>7} a\n{:>7} b\n", 3, 1));
    }

    #[tokio::test]
    async fn test_nl_numbers_non_empty_lines() {
        let (_, out, _) = run(&Nl, &[], "first\n\nsecond\n").await;
        assert_eq!(out, format!("{:>6}\tfirst\n\n{:>6}\tsecond\n", 1, 2));
    }

    #[test]
    fn test_parse_count_forms() {
        let args = vec!["-n".to_string(), "5".to_string()];
        assert_eq!(parse_count(&args, 10).unwrap().0, 5);
        let args = vec!["-n7".to_string()];
        assert_eq!(parse_count(&args, 10).unwrap().0, 7);
        assert!(parse_count(&["-n".to_string()], 10).is_err());
    }
}
