//! Stream filters: grep, sed, tr, cut.

use async_trait::async_trait;
use regex::RegexBuilder;

use super::{Command, CommandIo, complain, wants_help};
use crate::Result;
use crate::stream::ByteReader;

/// `grep [-v] [-i] [-n] PATTERN [FILE...]` — print matching lines.
pub struct Grep;

#[async_trait]
impl Command for Grep {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn usage(&self) -> &'static str {
        "usage: grep [-v] [-i] [-n] PATTERN [FILE...]\nPrint lines matching the regular expression PATTERN.\n  -v  invert the match\n  -i  ignore case\n  -n  prefix each line with its line number"
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut invert = false;
        let mut ignore_case = false;
        let mut number = false;
        let mut positional = Vec::new();
        for arg in args {
            match arg.as_str() {
                "-v" => invert = true,
                "-i" => ignore_case = true,
                "-n" => number = true,
                _ => positional.push(arg.clone()),
            }
        }

        let Some(pattern) = positional.first() else {
            complain(io, "grep", "missing pattern").await?;
            return Ok(2);
        };
        let regex = match RegexBuilder::new(pattern).case_insensitive(ignore_case).build() {
            Ok(re) => re,
            Err(e) => {
                complain(io, "grep", &format!("invalid pattern: {}", e)).await?;
                return Ok(2);
            }
        };

        let files = &positional[1..];
        let mut matched_any = false;

        if files.is_empty() {
            let stdin = io.stdin.clone();
            matched_any |= grep_stream(&stdin, io, &regex, invert, number).await?;
        } else {
            for name in files {
                let reader = io.open_input(name).await?;
                matched_any |= grep_stream(&reader, io, &regex, invert, number).await?;
            }
        }

        // POSIX: 0 when something matched, 1 when nothing did.
        Ok(if matched_any { 0 } else { 1 })
    }
}

async fn grep_stream(
    reader: &ByteReader,
    io: &CommandIo,
    regex: &regex::Regex,
    invert: bool,
    number: bool,
) -> Result<bool> {
    let mut matched = false;
    let mut line_no = 0usize;
    loop {
        let raw = reader.read_line_bytes().await?;
        if raw.is_empty() {
            return Ok(matched);
        }
        line_no += 1;
        let text = String::from_utf8_lossy(&raw);
        let body = text.strip_suffix('\n').unwrap_or(&text);
        if regex.is_match(body) != invert {
            matched = true;
            if number {
                io.stdout
                    .write_all(format!("{}:{}\n", line_no, body).as_bytes())
                    .await?;
            } else {
                io.stdout.write_all(format!("{}\n", body).as_bytes()).await?;
            }
        }
    }
}

/// `sed s/PATTERN/REPLACEMENT/[gi]` — regex substitution.
pub struct Sed;

struct Substitution {
    regex: regex::Regex,
    replacement: String,
    global: bool,
}

#[async_trait]
impl Command for Sed {
    fn name(&self) -> &'static str {
        "sed"
    }

    fn usage(&self) -> &'static str {
        "usage: sed s/PATTERN/REPLACEMENT/[gi]\nSubstitute PATTERN with REPLACEMENT on each input line.\n  g  replace every occurrence on the line\n  i  match case-insensitively\nOnly the substitution form is supported."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let Some(expr) = args.first() else {
            complain(io, "sed", "missing expression").await?;
            return Ok(2);
        };
        let subst = match parse_substitution(expr) {
            Ok(s) => s,
            Err(msg) => {
                complain(io, "sed", &msg).await?;
                return Ok(2);
            }
        };

        loop {
            let raw = io.stdin.read_line_bytes().await?;
            if raw.is_empty() {
                return Ok(0);
            }
            let text = String::from_utf8_lossy(&raw);
            let (body, newline) = match text.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (text.as_ref(), ""),
            };
            let replaced = if subst.global {
                subst.regex.replace_all(body, subst.replacement.as_str())
            } else {
                subst.regex.replace(body, subst.replacement.as_str())
            };
            io.stdout
                .write_all(format!("{}{}", replaced, newline).as_bytes())
                .await?;
        }
    }
}

/// Parses `s/PATTERN/REPLACEMENT/[gi]`, honoring `\/` escapes inside both
/// the pattern and the replacement.
fn parse_substitution(expr: &str) -> std::result::Result<Substitution, String> {
    let mut chars = expr.chars();
    if chars.next() != Some('s') || chars.next() != Some('/') {
        return Err(format!(
            "unsupported expression {:?}: only s/PATTERN/REPLACEMENT/[gi] is supported",
            expr
        ));
    }

    let mut parts: Vec<String> = vec![String::new()];
    let mut escaped = false;
    for c in chars {
        if escaped {
            if c != '/' {
                parts.last_mut().unwrap().push('\\');
            }
            parts.last_mut().unwrap().push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '/' {
            parts.push(String::new());
        } else {
            parts.last_mut().unwrap().push(c);
        }
    }
    if escaped {
        parts.last_mut().unwrap().push('\\');
    }

    if parts.len() != 3 {
        return Err(format!(
            "malformed substitution {:?}: expected s/PATTERN/REPLACEMENT/[gi]",
            expr
        ));
    }

    let pattern = &parts[0];
    let replacement = &parts[1];
    let mut global = false;
    let mut ignore_case = false;
    for flag in parts[2].chars() {
        match flag {
            'g' => global = true,
            'i' => ignore_case = true,
            other => return Err(format!("unsupported substitution flag {:?}", other)),
        }
    }

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| format!("invalid pattern: {}", e))?;

    Ok(Substitution {
        regex,
        replacement: convert_replacement(replacement),
        global,
    })
}

/// Converts sed replacement syntax (`&`, `\1`..`\9`) into the regex crate's
/// `$`-based syntax, escaping any literal `$`.
fn convert_replacement(repl: &str) -> String {
    let mut out = String::new();
    let mut chars = repl.chars();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '&' => out.push_str("${0}"),
            '\\' => match chars.next() {
                Some(d @ '1'..='9') => {
                    out.push_str("${");
                    out.push(d);
                    out.push('}');
                }
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

/// `tr [-d] SET1 [SET2]` — translate or delete characters.
pub struct Tr;

#[async_trait]
impl Command for Tr {
    fn name(&self) -> &'static str {
        "tr"
    }

    fn usage(&self) -> &'static str {
        "usage: tr [-d] SET1 [SET2]\nTranslate characters of SET1 to the corresponding characters of SET2,\nor delete the characters of SET1 with -d. Sets support ranges (a-z) and\nthe escapes \\n, \\t and \\\\."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut delete = false;
        let mut sets = Vec::new();
        for arg in args {
            match arg.as_str() {
                "-d" => delete = true,
                _ => sets.push(arg.clone()),
            }
        }

        let Some(set1_spec) = sets.first() else {
            complain(io, "tr", "missing operand").await?;
            return Ok(2);
        };
        let set1 = expand_set(set1_spec);

        let set2 = if delete {
            Vec::new()
        } else {
            match sets.get(1) {
                Some(spec) => expand_set(spec),
                None => {
                    complain(io, "tr", "missing SET2").await?;
                    return Ok(2);
                }
            }
        };
        if !delete && set2.is_empty() {
            complain(io, "tr", "SET2 must not be empty").await?;
            return Ok(2);
        }

        loop {
            let raw = io.stdin.read_line_bytes().await?;
            if raw.is_empty() {
                return Ok(0);
            }
            let text = String::from_utf8_lossy(&raw);
            let mut out = String::with_capacity(text.len());
            for c in text.chars() {
                match set1.iter().position(|&s| s == c) {
                    Some(_) if delete => {}
                    Some(i) => out.push(set2[i.min(set2.len() - 1)]),
                    None => out.push(c),
                }
            }
            io.stdout.write_all(out.as_bytes()).await?;
        }
    }
}

/// Expands a tr set: ranges `a-z` plus `\n`, `\t`, `\\` escapes.
fn expand_set(spec: &str) -> Vec<char> {
    let mut literal = Vec::new();
    let mut chars = spec.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => literal.push('\n'),
                Some('t') => literal.push('\t'),
                Some(other) => literal.push(other),
                None => literal.push('\\'),
            }
        } else {
            literal.push(c);
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < literal.len() {
        if i + 2 < literal.len() && literal[i + 1] == '-' && literal[i] <= literal[i + 2] {
            for code in literal[i] as u32..=literal[i + 2] as u32 {
                if let Some(c) = char::from_u32(code) {
                    out.push(c);
                }
            }
            i += 3;
        } else {
            out.push(literal[i]);
            i += 1;
        }
    }
    out
}

/// `cut -d DELIM -f LIST | cut -c LIST` — select fields or characters.
pub struct Cut;

#[async_trait]
impl Command for Cut {
    fn name(&self) -> &'static str {
        "cut"
    }

    fn usage(&self) -> &'static str {
        "usage: cut -f LIST [-d DELIM] | cut -c LIST\nSelect fields (-f, split on DELIM, default tab) or character positions\n(-c) from each line. LIST is comma-separated: N, N-M, N-, -M."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut delim = '\t';
        let mut fields_list: Option<String> = None;
        let mut chars_list: Option<String> = None;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-d" => match iter.next() {
                    Some(d) if d.chars().count() == 1 => delim = d.chars().next().unwrap(),
                    _ => {
                        complain(io, "cut", "-d requires a single-character delimiter").await?;
                        return Ok(2);
                    }
                },
                "-f" => fields_list = iter.next().cloned(),
                "-c" => chars_list = iter.next().cloned(),
                other if other.starts_with("-d") => {
                    let rest = &other[2..];
                    if rest.chars().count() == 1 {
                        delim = rest.chars().next().unwrap();
                    } else {
                        complain(io, "cut", "-d requires a single-character delimiter").await?;
                        return Ok(2);
                    }
                }
                other if other.starts_with("-f") => fields_list = Some(other[2..].to_string()),
                other if other.starts_with("-c") => chars_list = Some(other[2..].to_string()),
                other => {
                    complain(io, "cut", &format!("unexpected argument {:?}", other)).await?;
                    return Ok(2);
                }
            }
        }

        let (list_spec, by_fields) = match (fields_list, chars_list) {
            (Some(spec), None) => (spec, true),
            (None, Some(spec)) => (spec, false),
            _ => {
                complain(io, "cut", "exactly one of -f or -c is required").await?;
                return Ok(2);
            }
        };
        let ranges = match parse_list(&list_spec) {
            Ok(r) => r,
            Err(msg) => {
                complain(io, "cut", &msg).await?;
                return Ok(2);
            }
        };

        loop {
            let raw = io.stdin.read_line_bytes().await?;
            if raw.is_empty() {
                return Ok(0);
            }
            let text = String::from_utf8_lossy(&raw);
            let (body, newline) = match text.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (text.as_ref(), ""),
            };

            let out = if by_fields {
                if body.contains(delim) {
                    let parts: Vec<&str> = body.split(delim).collect();
                    let selected: Vec<&str> = (1..=parts.len())
                        .filter(|n| in_ranges(&ranges, *n))
                        .map(|n| parts[n - 1])
                        .collect();
                    selected.join(&delim.to_string())
                } else {
                    // No delimiter on the line: emit it unchanged.
                    body.to_string()
                }
            } else {
                body.chars()
                    .enumerate()
                    .filter(|(i, _)| in_ranges(&ranges, i + 1))
                    .map(|(_, c)| c)
                    .collect()
            };
            io.stdout
                .write_all(format!("{}{}", out, newline).as_bytes())
                .await?;
        }
    }
}

type RangeList = Vec<(usize, Option<usize>)>;

/// Parses a cut LIST: `N`, `N-M`, `N-`, `-M`, comma-separated. 1-based.
fn parse_list(spec: &str) -> std::result::Result<RangeList, String> {
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let parsed = if let Some(rest) = part.strip_prefix('-') {
            let end: usize = rest
                .parse()
                .map_err(|_| format!("invalid list component {:?}", part))?;
            (1, Some(end))
        } else if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .parse()
                .map_err(|_| format!("invalid list component {:?}", part))?;
            if end.is_empty() {
                (start, None)
            } else {
                let end: usize = end
                    .parse()
                    .map_err(|_| format!("invalid list component {:?}", part))?;
                (start, Some(end))
            }
        } else {
            let n: usize = part
                .parse()
                .map_err(|_| format!("invalid list component {:?}", part))?;
            (n, Some(n))
        };
        if parsed.0 == 0 {
            return Err("positions are numbered from 1".to_string());
        }
        ranges.push(parsed);
    }
    if ranges.is_empty() {
        return Err("empty list".to_string());
    }
    Ok(ranges)
}

fn in_ranges(ranges: &RangeList, n: usize) -> bool {
    ranges
        .iter()
        .any(|(start, end)| n >= *start && end.map(|e| n <= e).unwrap_or(true))
}
