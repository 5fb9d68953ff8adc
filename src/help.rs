//! The help catalogue: keyed usage guides for the model.
//!
//! Eleven topic keys map to lists of subsection names; subsections map to
//! prose blocks. A lookup takes 1–11 keys, unions their subsections,
//! deduplicates, sorts, and emits each block under a header line. The same
//! catalogue backs both the `help` tool call and the `help` built-in
//! command.

use crate::{Error, Result};

/// The topic keys, in their canonical order.
pub const HELP_KEYS: [&str; 11] = [
    "basic_operations",
    "data_analysis",
    "text_processing",
    "file_operations",
    "content_search",
    "format_conversion",
    "log_analysis",
    "batch_processing",
    "interactive_workflow",
    "debugging",
    "command_usage",
];

/// Maximum number of keys accepted in one lookup.
pub const MAX_KEYS: usize = HELP_KEYS.len();

fn subsections_for(key: &str) -> Option<&'static [&'static str]> {
    Some(match key {
        "basic_operations" => &["workflow_basics", "fd_concepts", "tool_reference"],
        "data_analysis" => &["sorting_and_counting", "field_extraction", "pipeline_patterns"],
        "text_processing" => &["substitution", "line_windows", "pipeline_patterns"],
        "file_operations" => &["virtual_files", "redirection", "fd_concepts"],
        "content_search" => &["searching", "pipeline_patterns"],
        "format_conversion" => &["field_extraction", "substitution", "character_translation"],
        "log_analysis" => &["searching", "sorting_and_counting", "line_windows"],
        "batch_processing" => &["pipeline_patterns", "redirection", "virtual_files"],
        "interactive_workflow" => &["workflow_basics", "background_spawns", "fd_concepts"],
        "debugging" => &["troubleshooting", "binary_data", "background_spawns"],
        "command_usage" => &["command_reference"],
        _ => return None,
    })
}

fn prose_for(subsection: &str) -> &'static str {
    match subsection {
        "workflow_basics" => {
            "The core loop is read, process, write, exit. Read input from fd 0 (or an \
             opened file), transform it with spawned pipelines, write results to fd 1 \
             (or an opened output file), then call exit with code 0. Keep each step \
             small: one spawn per transformation is easier to debug than one giant \
             script."
        }
        "fd_concepts" => {
            "File descriptors are numbered handles: 0 is stdin, 1 is stdout, 2 is \
             stderr, and every open or spawn allocates new ones starting at 3. A \
             descriptor is either readable or writable, never both directions at \
             once for pipes. Close descriptors when done; closing the output of a \
             background pipeline also reports its exit code."
        }
        "tool_reference" => {
            "Seven tools are available. read takes fd plus either lines or count. \
             write takes fd, data, and optional newline/eof flags; set eof after the \
             last write so downstream commands can finish. open takes a path and a \
             mode (r, w, a, r+, w+, a+). spawn runs a pipeline script. close \
             releases a descriptor. help returns these guides. exit ends the \
             session."
        }
        "pipeline_patterns" => {
            "Pipelines connect commands with |, for example \"grep ERROR | sort | \
             uniq -c\". Sequence independent steps with ; and make steps conditional \
             with && (run on success) or || (run on failure). Redirect with < file, \
             > file, >> file (append) and 2> file for stderr."
        }
        "redirection" => {
            "Per-command redirections name files in the sandbox: > writes (creating \
             a virtual file when the name is not a declared output), >> appends, \
             < reads. A redirection target that is not a declared real file lives in \
             memory and can be re-opened by later spawns under the same name."
        }
        "searching" => {
            "grep selects lines by regular expression. Use -i for case-insensitive \
             matching, -v to keep non-matching lines, and -n to prefix line numbers. \
             The pattern is a single argument; quote it when it contains spaces or \
             pipe characters."
        }
        "substitution" => {
            "sed supports exactly one form: s/PATTERN/REPLACEMENT/ with optional g \
             (all occurrences) and i (ignore case) flags. PATTERN is a regular \
             expression; in REPLACEMENT, & inserts the whole match and \\1 through \
             \\9 insert capture groups."
        }
        "sorting_and_counting" => {
            "sort orders lines lexicographically; -n compares by leading number \
             (lines without a number sort first), -r reverses, -u drops duplicates. \
             uniq collapses adjacent duplicates, so sort before uniq; uniq -c \
             prefixes counts. wc reports line, word and byte counts."
        }
        "field_extraction" => {
            "cut selects columns: -f picks delimited fields (set the delimiter with \
             -d, default tab) and -c picks character positions. Lists are \
             comma-separated numbers and ranges such as 1,3-5 or 2-. Lines without \
             the delimiter pass through unchanged."
        }
        "character_translation" => {
            "tr maps characters of SET1 to the corresponding characters of SET2, \
             extending the last SET2 character as needed; -d deletes the characters \
             of SET1 instead. Sets accept ranges like a-z and the escapes \\n, \\t \
             and \\\\."
        }
        "line_windows" => {
            "head -n N keeps the first N lines, tail -n N the last N (both default \
             to 10). nl numbers non-empty lines. rev reverses the characters of each \
             line."
        }
        "virtual_files" => {
            "Names opened for writing that are not declared outputs become virtual \
             files held in memory. A virtual file can be opened for reading any \
             number of times; each open starts at the beginning of the bytes \
             written so far. Anonymous pipes created by spawn are different: their \
             data can be read exactly once."
        }
        "background_spawns" => {
            "spawn without in_fd and out_fd runs in the background and returns both \
             descriptors: write the pipeline's input to in_fd (finishing with \
             eof=true), then read results from out_fd until empty. Passing both \
             descriptors instead runs the pipeline synchronously and returns its \
             exit code directly."
        }
        "binary_data" => {
            "Handles carry raw bytes, but tool results travel as text. When probing \
             data that may be binary, read small chunks (16 bytes or fewer) and \
             inspect them before committing to a strategy; large binary reads waste \
             the token budget and may be mangled."
        }
        "troubleshooting" => {
            "If read returns empty immediately, the stream is at EOF: check that \
             eof was sent on the producing side and that the right descriptor is \
             used. \"invalid file descriptor\" means the handle was closed or never \
             allocated. A non-zero exit code from close reflects the pipeline's \
             rightmost failing command; re-run with a tee stage to capture \
             intermediate data."
        }
        "command_reference" => {
            "Available commands: cat, cut, diff, echo, grep, head, help, nl, patch, \
             rev, sed, sort, tail, tee, tr, uniq, wc. Every command prints its own \
             usage with --help. diff and patch read two-part stdin split on their \
             separator lines; see their usage text for the exact format."
        }
        _ => "",
    }
}

/// Looks up 1–[`MAX_KEYS`] topic keys and renders the union of their
/// subsections, deduplicated and sorted, each under a header line.
pub fn lookup(keys: &[String]) -> Result<String> {
    if keys.is_empty() {
        return Err(Error::invalid_input("help requires at least one key"));
    }
    if keys.len() > MAX_KEYS {
        return Err(Error::invalid_input(format!(
            "help accepts at most {} keys, got {}",
            MAX_KEYS,
            keys.len()
        )));
    }

    let mut subsections: Vec<&'static str> = Vec::new();
    for key in keys {
        let list = subsections_for(key).ok_or_else(|| {
            Error::invalid_input(format!(
                "unknown help key {:?} (expected one of: {})",
                key,
                HELP_KEYS.join(", ")
            ))
        })?;
        for subsection in list {
            if !subsections.contains(subsection) {
                subsections.push(subsection);
            }
        }
    }
    subsections.sort_unstable();

    let mut out = String::new();
    for subsection in subsections {
        out.push_str(&format!("=== {} ===\n", subsection));
        out.push_str(prose_for(subsection));
        out.push_str("\n\n");
    }
    Ok(out.trim_end().to_string() + "\n")
}
