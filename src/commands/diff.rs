//! The diff command: unified diffs over a two-part stdin.
//!
//! Input arrives as one stream holding both texts, split on the literal
//! separator line [`DIFF_SEPARATOR`]. Output is a unified diff with
//! three lines of context, `--- a/file` / `+++ b/file` headers and
//! `@@ -oldStart,oldLen +newStart,newLen @@` chunk headers — the exact shape
//! the patch command consumes.

use async_trait::async_trait;

use super::{Command, CommandIo, complain, wants_help};
use crate::Result;

/// Literal line separating the two texts on stdin.
pub const DIFF_SEPARATOR: &str = "---LLMCMD_DIFF_SEPARATOR---";

/// Context lines kept on each side of a change.
const CONTEXT: usize = 3;

/// `diff` — unified diff of the two stdin sections.
pub struct Diff;

#[async_trait]
impl Command for Diff {
    fn name(&self) -> &'static str {
        "diff"
    }

    fn usage(&self) -> &'static str {
        "usage: diff\nRead two texts from stdin separated by the line\n---LLMCMD_DIFF_SEPARATOR---\nand print their unified diff with 3 lines of context.\nExit status: 0 when identical, 1 when different."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let text = io.stdin.read_to_string_lossy().await?;
        let Some((old_text, new_text)) = split_on_separator(&text, DIFF_SEPARATOR) else {
            complain(
                io,
                "diff",
                &format!("missing separator line {:?}", DIFF_SEPARATOR),
            )
            .await?;
            return Ok(2);
        };

        let old_lines: Vec<&str> = old_text.lines().collect();
        let new_lines: Vec<&str> = new_text.lines().collect();
        let hunks = unified_hunks(&old_lines, &new_lines, CONTEXT);
        if hunks.is_empty() {
            return Ok(0);
        }

        let mut out = String::from("--- a/file\n+++ b/file\n");
        for hunk in &hunks {
            out.push_str(&hunk.render());
        }
        io.stdout.write_all(out.as_bytes()).await?;
        Ok(1)
    }
}

/// Splits `text` on the first line equal to `separator`, returning the
/// texts before and after it.
pub(crate) fn split_on_separator<'a>(
    text: &'a str,
    separator: &str,
) -> Option<(String, String)> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut seen = false;
    for line in text.lines() {
        if !seen && line == separator {
            seen = true;
            continue;
        }
        if seen {
            after.push(line);
        } else {
            before.push(line);
        }
    }
    if !seen {
        return None;
    }
    let mut before = before.join("\n");
    let mut after = after.join("\n");
    if !before.is_empty() {
        before.push('\n');
    }
    if !after.is_empty() {
        after.push('\n');
    }
    Some((before, after))
}

/// One unified-diff hunk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    /// Body lines with their ` `, `-` or `+` prefix character.
    pub lines: Vec<String>,
}

impl Hunk {
    fn render(&self) -> String {
        let mut out = format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, self.old_len, self.new_start, self.new_len
        );
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EditTag {
    Equal,
    Delete,
    Insert,
}

struct Edit<'a> {
    tag: EditTag,
    text: &'a str,
}

/// Computes the line-level edit script via longest-common-subsequence.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Edit<'a>> {
    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            ops.push(Edit {
                tag: EditTag::Equal,
                text: old[i],
            });
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Edit {
                tag: EditTag::Delete,
                text: old[i],
            });
            i += 1;
        } else {
            ops.push(Edit {
                tag: EditTag::Insert,
                text: new[j],
            });
            j += 1;
        }
    }
    for line in &old[i..] {
        ops.push(Edit {
            tag: EditTag::Delete,
            text: line,
        });
    }
    for line in &new[j..] {
        ops.push(Edit {
            tag: EditTag::Insert,
            text: line,
        });
    }
    ops
}

/// Groups an edit script into context-bounded hunks.
pub(crate) fn unified_hunks(old: &[&str], new: &[&str], context: usize) -> Vec<Hunk> {
    let ops = edit_script(old, new);

    // Old/new line offsets (0-based) before each op.
    let mut positions = Vec::with_capacity(ops.len());
    let (mut o, mut n) = (0usize, 0usize);
    for op in &ops {
        positions.push((o, n));
        match op.tag {
            EditTag::Equal => {
                o += 1;
                n += 1;
            }
            EditTag::Delete => o += 1,
            EditTag::Insert => n += 1,
        }
    }

    let mut hunks = Vec::new();
    let mut i = 0;
    let mut consumed = 0usize;
    while i < ops.len() {
        if ops[i].tag == EditTag::Equal {
            i += 1;
            continue;
        }

        // Change found: extend forward, swallowing equal runs short enough
        // that merging beats starting a fresh hunk.
        let mut last_change = i;
        let mut j = i + 1;
        while j < ops.len() {
            if ops[j].tag != EditTag::Equal {
                last_change = j;
                j += 1;
                continue;
            }
            let mut k = j;
            while k < ops.len() && ops[k].tag == EditTag::Equal {
                k += 1;
            }
            if k >= ops.len() || k - j > 2 * context {
                break;
            }
            j = k;
        }

        let begin = i.saturating_sub(context).max(consumed);
        let end = (last_change + 1 + context).min(ops.len());

        let mut old_len = 0;
        let mut new_len = 0;
        let mut lines = Vec::with_capacity(end - begin);
        for op in &ops[begin..end] {
            let (prefix, counts) = match op.tag {
                EditTag::Equal => (' ', (1, 1)),
                EditTag::Delete => ('-', (1, 0)),
                EditTag::Insert => ('+', (0, 1)),
            };
            old_len += counts.0;
            new_len += counts.1;
            lines.push(format!("{}{}", prefix, op.text));
        }

        let (old_off, new_off) = positions[begin];
        hunks.push(Hunk {
            // Unified convention: a zero-length side reports the line
            // before the change site.
            old_start: if old_len > 0 { old_off + 1 } else { old_off },
            old_len,
            new_start: if new_len > 0 { new_off + 1 } else { new_off },
            new_len,
            lines,
        });

        consumed = end;
        i = end;
    }
    hunks
}

#[cfg(test)]
mod tests {
    use super::super::testutil::run;
    use super::*;

    #[tokio::test]
    async fn test_identical_inputs_produce_nothing() {
        let input = format!("a\nb\n{}\na\nb\n", DIFF_SEPARATOR);
        let (code, out, _) = run(&Diff, &[], &input).await;
        assert_eq!(code, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_single_line_change() {
        let input = format!(
            "line 1\nline 2\nline 3\n{}\nline 1\nline X\nline 3\n",
            DIFF_SEPARATOR
        );
        let (code, out, _) = run(&Diff, &[], &input).await;
        assert_eq!(code, 1);
        assert_eq!(
            out,
            "--- a/file\n+++ b/file\n@@ -1,3 +1,3 @@\n line 1\n-line 2\n+line X\n line 3\n"
        );
    }

    #[tokio::test]
    async fn test_missing_separator_is_an_error() {
        let (code, _, err) = run(&Diff, &[], "just one text\n").await;
        assert_eq!(code, 2);
        assert!(err.contains("missing separator"));
    }

    #[tokio::test]
    async fn test_distant_changes_produce_two_hunks() {
        let old: String = (1..=20).map(|i| format!("l{}\n", i)).collect();
        let new = old.replace("l2\n", "L2\n").replace("l19\n", "L19\n");
        let input = format!("{}{}\n{}", old, DIFF_SEPARATOR, new);
        let (_, out, _) = run(&Diff, &[], &input).await;
        assert_eq!(out.matches("@@").count(), 4); // two hunks, two markers each
    }

    #[test]
    fn test_hunk_numbering_for_pure_insert() {
        let old = vec!["a", "b"];
        let new = vec!["a", "x", "b"];
        let hunks = unified_hunks(&old, &new, 3);
        assert_eq!(hunks.len(), 1);
        let h = &hunks[0];
        assert_eq!((h.old_start, h.old_len), (1, 2));
        assert_eq!((h.new_start, h.new_len), (1, 3));
    }

    #[test]
    fn test_hunk_for_append_at_end() {
        let old = vec!["a"];
        let new = vec!["a", "b"];
        let hunks = unified_hunks(&old, &new, 3);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].lines, vec![" a", "+b"]);
    }

    #[test]
    fn test_split_on_separator() {
        let text = format!("one\n{}\ntwo\n", DIFF_SEPARATOR);
        let (before, after) = split_on_separator(&text, DIFF_SEPARATOR).unwrap();
        assert_eq!(before, "one\n");
        assert_eq!(after, "two\n");
        assert!(split_on_separator("no sep", DIFF_SEPARATOR).is_none());
    }
}
