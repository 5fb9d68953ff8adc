//! The patch command: apply a unified diff to a two-part stdin.
//!
//! Input is `(original, unified diff)` split on the literal separator line
//! [`PATCH_SEPARATOR`]. Chunks are applied in reverse order so earlier
//! applications cannot shift the line numbers of later ones. Validation
//! failures identify the chunk index, the absolute line number, the text the
//! diff expected and the text actually found.

use async_trait::async_trait;

use super::diff::split_on_separator;
use super::{Command, CommandIo, complain, wants_help};
use crate::Result;

/// Literal line separating the original text from the diff on stdin.
pub const PATCH_SEPARATOR: &str = "---LLMCMD_PATCH_SEPARATOR---";

/// `patch [--dry-run]` — apply a unified diff.
pub struct Patch;

#[async_trait]
impl Command for Patch {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn usage(&self) -> &'static str {
        "usage: patch [--dry-run]\nRead an original text and a unified diff from stdin separated by the line\n---LLMCMD_PATCH_SEPARATOR---\nand print the patched text. --dry-run validates without printing."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }
        let dry_run = args.iter().any(|a| a == "--dry-run");

        let text = io.stdin.read_to_string_lossy().await?;
        let Some((original, diff)) = split_on_separator(&text, PATCH_SEPARATOR) else {
            complain(
                io,
                "patch",
                &format!("missing separator line {:?}", PATCH_SEPARATOR),
            )
            .await?;
            return Ok(2);
        };

        let chunks = match parse_unified_diff(&diff) {
            Ok(chunks) => chunks,
            Err(msg) => {
                complain(io, "patch", &msg).await?;
                return Ok(2);
            }
        };

        let original_lines: Vec<String> = original.lines().map(str::to_string).collect();
        match apply_chunks(&original_lines, &chunks) {
            Ok(patched) => {
                if !dry_run {
                    let mut out = patched.join("\n");
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    io.stdout.write_all(out.as_bytes()).await?;
                }
                Ok(0)
            }
            Err(failure) => {
                complain(io, "patch", &failure.to_string()).await?;
                Ok(1)
            }
        }
    }
}

/// One parsed `@@` chunk.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub old_start: usize,
    pub old_len: usize,
    #[allow(dead_code)]
    pub new_start: usize,
    pub new_len: usize,
    /// Body lines as (tag, text) with tag one of ' ', '-', '+'.
    pub lines: Vec<(char, String)>,
}

/// A validation failure, pinned to a chunk and an absolute original line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PatchFailure {
    pub chunk: usize,
    pub line: usize,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for PatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk {}, line {}: expected {:?}, got {:?}",
            self.chunk, self.line, self.expected, self.actual
        )
    }
}

/// Parses `n` or `n,m` from a hunk header range. `n` alone means length 1;
/// `n,0` is a valid empty side.
fn parse_range(spec: &str) -> std::result::Result<(usize, usize), String> {
    let spec = spec.trim();
    match spec.split_once(',') {
        Some((start, len)) => {
            let start = start
                .parse()
                .map_err(|_| format!("invalid range start {:?}", spec))?;
            let len = len
                .parse()
                .map_err(|_| format!("invalid range length {:?}", spec))?;
            Ok((start, len))
        }
        None => {
            let start = spec
                .parse()
                .map_err(|_| format!("invalid range {:?}", spec))?;
            Ok((start, 1))
        }
    }
}

/// Parses the hunks of a unified diff, skipping `---`/`+++` file headers.
pub(crate) fn parse_unified_diff(diff: &str) -> std::result::Result<Vec<Chunk>, String> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut remaining_old = 0usize;
    let mut remaining_new = 0usize;

    for line in diff.lines() {
        if let Some(header) = line.strip_prefix("@@") {
            let header = header
                .split("@@")
                .next()
                .ok_or_else(|| format!("malformed hunk header {:?}", line))?
                .trim();
            let mut old_spec = None;
            let mut new_spec = None;
            for part in header.split_whitespace() {
                if let Some(spec) = part.strip_prefix('-') {
                    old_spec = Some(parse_range(spec)?);
                } else if let Some(spec) = part.strip_prefix('+') {
                    new_spec = Some(parse_range(spec)?);
                }
            }
            let (old_start, old_len) =
                old_spec.ok_or_else(|| format!("hunk header missing old range: {:?}", line))?;
            let (new_start, new_len) =
                new_spec.ok_or_else(|| format!("hunk header missing new range: {:?}", line))?;
            chunks.push(Chunk {
                old_start,
                old_len,
                new_start,
                new_len,
                lines: Vec::new(),
            });
            remaining_old = old_len;
            remaining_new = new_len;
            continue;
        }

        if remaining_old == 0 && remaining_new == 0 {
            // Between hunks: file headers and anything else are ignored.
            continue;
        }
        let chunk = chunks.last_mut().expect("counts imply a current chunk");

        let (tag, text) = match line.chars().next() {
            Some('-') => ('-', &line[1..]),
            Some('+') => ('+', &line[1..]),
            Some(' ') => (' ', &line[1..]),
            Some('\\') => continue, // "\ No newline at end of file"
            None => (' ', ""),      // bare empty line counts as empty context
            Some(_) => {
                return Err(format!("unexpected line inside hunk: {:?}", line));
            }
        };
        match tag {
            '-' => {
                if remaining_old == 0 {
                    return Err("hunk has more '-' lines than its header declares".to_string());
                }
                remaining_old -= 1;
            }
            '+' => {
                if remaining_new == 0 {
                    return Err("hunk has more '+' lines than its header declares".to_string());
                }
                remaining_new -= 1;
            }
            _ => {
                if remaining_old == 0 || remaining_new == 0 {
                    return Err("hunk has more context lines than its header declares".to_string());
                }
                remaining_old -= 1;
                remaining_new -= 1;
            }
        }
        chunk.lines.push((tag, text.to_string()));
    }

    if remaining_old != 0 || remaining_new != 0 {
        return Err("truncated hunk: body shorter than its header declares".to_string());
    }
    if chunks.is_empty() {
        return Err("no hunks found in diff".to_string());
    }
    Ok(chunks)
}

/// Applies the chunks to `original`, in reverse order so line numbers stay
/// valid as earlier text is spliced.
pub(crate) fn apply_chunks(
    original: &[String],
    chunks: &[Chunk],
) -> std::result::Result<Vec<String>, PatchFailure> {
    let mut result: Vec<String> = original.to_vec();

    for (rev_index, chunk) in chunks.iter().enumerate().rev() {
        let chunk_no = rev_index + 1;
        // A zero-length old side addresses the line *after* which the
        // insertion happens; a populated one is 1-based.
        let start = if chunk.old_len > 0 {
            chunk.old_start.saturating_sub(1)
        } else {
            chunk.old_start
        };

        // Validate the old side against what is actually there.
        let mut offset = 0usize;
        for (tag, text) in &chunk.lines {
            if *tag == '+' {
                continue;
            }
            let index = start + offset;
            let actual = result.get(index).cloned();
            if actual.as_deref() != Some(text.as_str()) {
                return Err(PatchFailure {
                    chunk: chunk_no,
                    line: index + 1,
                    expected: text.clone(),
                    actual: actual.unwrap_or_else(|| "<end of file>".to_string()),
                });
            }
            offset += 1;
        }

        let replacement: Vec<String> = chunk
            .lines
            .iter()
            .filter(|(tag, _)| *tag != '-')
            .map(|(_, text)| text.clone())
            .collect();
        debug_assert_eq!(replacement.len(), chunk.new_len);

        result.splice(start..start + chunk.old_len, replacement);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::super::diff::{DIFF_SEPARATOR, Diff};
    use super::super::testutil::run;
    use super::*;

    #[tokio::test]
    async fn test_patch_applies_single_chunk() {
        let input = format!(
            "line 1\nline 2\nline 3\n{}\n@@ -2,1 +2,1 @@\n-line 2\n+line two\n",
            PATCH_SEPARATOR
        );
        let (code, out, _) = run(&Patch, &[], &input).await;
        assert_eq!(code, 0);
        assert_eq!(out, "line 1\nline two\nline 3\n");
    }

    #[tokio::test]
    async fn test_patch_mismatch_names_chunk_line_expected_actual() {
        let input = format!(
            "line 1\nline 2\nline 3\n{}\n@@ -2,1 +2,1 @@\n-line X\n+line Z\n",
            PATCH_SEPARATOR
        );
        let (code, out, err) = run(&Patch, &[], &input).await;
        assert_eq!(code, 1);
        assert!(out.is_empty());
        assert!(err.contains("chunk 1"), "err was: {}", err);
        assert!(
            err.contains(r#"expected "line X", got "line 2""#),
            "err was: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_dry_run_validates_without_output() {
        let ok = format!(
            "a\nb\n{}\n@@ -1,1 +1,1 @@\n-a\n+A\n",
            PATCH_SEPARATOR
        );
        let (code, out, _) = run(&Patch, &["--dry-run"], &ok).await;
        assert_eq!(code, 0);
        assert!(out.is_empty());

        let bad = format!(
            "a\nb\n{}\n@@ -1,1 +1,1 @@\n-x\n+A\n",
            PATCH_SEPARATOR
        );
        let (wet_code, _, _) = run(&Patch, &[], &bad).await;
        let (dry_code, dry_out, _) = run(&Patch, &["--dry-run"], &bad).await;
        // Dry run agrees with the real run on success/failure.
        assert_eq!(wet_code, dry_code);
        assert_eq!(dry_code, 1);
        assert!(dry_out.is_empty());
    }

    #[tokio::test]
    async fn test_reverse_order_keeps_line_numbers_valid() {
        let input = format!(
            "l1\nl2\nl3\nl4\nl5\n{}\n@@ -1,1 +1,2 @@\n-l1\n+l1\n+inserted\n@@ -4,1 +5,1 @@\n-l4\n+L4\n",
            PATCH_SEPARATOR
        );
        let (code, out, err) = run(&Patch, &[], &input).await;
        assert_eq!(code, 0, "stderr: {}", err);
        assert_eq!(out, "l1\ninserted\nl2\nl3\nL4\nl5\n");
    }

    #[tokio::test]
    async fn test_round_trip_with_diff() {
        let old = "alpha\nbeta\ngamma\ndelta\n";
        let new = "alpha\nBETA\ngamma\ndelta\nepsilon\n";

        let diff_input = format!("{}{}\n{}", old, DIFF_SEPARATOR, new);
        let (_, diff_out, _) = run(&Diff, &[], &diff_input).await;
        assert!(!diff_out.is_empty());

        let patch_input = format!("{}{}\n{}", old, PATCH_SEPARATOR, diff_out);
        let (code, patched, err) = run(&Patch, &[], &patch_input).await;
        assert_eq!(code, 0, "stderr: {}", err);
        assert_eq!(patched, new);
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("2,1").unwrap(), (2, 1));
        assert_eq!(parse_range("7").unwrap(), (7, 1));
        // n,0 is a legal empty side.
        assert_eq!(parse_range("3,0").unwrap(), (3, 0));
        assert!(parse_range("x").is_err());
    }

    #[test]
    fn test_empty_old_side_inserts_after_line() {
        let original = vec!["a".to_string(), "b".to_string()];
        let chunks = parse_unified_diff("@@ -1,0 +2,1 @@\n+inserted\n").unwrap();
        let result = apply_chunks(&original, &chunks).unwrap();
        assert_eq!(result, vec!["a", "inserted", "b"]);
    }

    #[test]
    fn test_truncated_hunk_is_a_parse_error() {
        assert!(parse_unified_diff("@@ -1,2 +1,2 @@\n a\n").is_err());
        assert!(parse_unified_diff("").is_err());
    }
}
