//! Pass-through and accounting commands: cat, echo, tee, rev, wc.

use async_trait::async_trait;

use super::{Command, CommandIo, read_all_input, wants_help};
use crate::Result;

const CHUNK: usize = 8192;

/// `cat [FILE...]` — concatenate inputs to stdout.
pub struct Cat;

#[async_trait]
impl Command for Cat {
    fn name(&self) -> &'static str {
        "cat"
    }

    fn usage(&self) -> &'static str {
        "usage: cat [FILE...]\nConcatenate the named files (or stdin) to stdout."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let files: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        if files.is_empty() {
            copy_stream(&io.stdin, io).await?;
        } else {
            for name in files {
                let reader = io.open_input(name).await?;
                copy_stream(&reader, io).await?;
            }
        }
        Ok(0)
    }
}

async fn copy_stream(reader: &crate::stream::ByteReader, io: &CommandIo) -> Result<()> {
    loop {
        let chunk = reader.read_some(CHUNK).await?;
        if chunk.is_empty() {
            return Ok(());
        }
        io.stdout.write_all(&chunk).await?;
    }
}

/// `echo [-n] [ARG...]` — print arguments.
pub struct Echo;

#[async_trait]
impl Command for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn usage(&self) -> &'static str {
        "usage: echo [-n] [ARG...]\nPrint the arguments separated by spaces. -n suppresses the trailing newline."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let (no_newline, rest) = match args.first() {
            Some(flag) if flag == "-n" => (true, &args[1..]),
            _ => (false, args),
        };

        let mut out = rest.join(" ");
        if !no_newline {
            out.push('\n');
        }
        io.stdout.write_all(out.as_bytes()).await?;
        Ok(0)
    }
}

/// `tee [-a] [FILE...]` — copy stdin to stdout and every named file.
pub struct Tee;

#[async_trait]
impl Command for Tee {
    fn name(&self) -> &'static str {
        "tee"
    }

    fn usage(&self) -> &'static str {
        "usage: tee [-a] [FILE...]\nCopy stdin to stdout and to each FILE. -a appends instead of truncating."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let append = args.iter().any(|a| a == "-a");
        let mut writers = Vec::new();
        for name in args.iter().filter(|a| !a.starts_with('-')) {
            writers.push(io.open_output(name, append).await?);
        }

        loop {
            let chunk = io.stdin.read_some(CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            io.stdout.write_all(&chunk).await?;
            for writer in &writers {
                writer.write_all(&chunk).await?;
            }
        }
        Ok(0)
    }
}

/// `rev` — reverse the characters of each line.
pub struct Rev;

#[async_trait]
impl Command for Rev {
    fn name(&self) -> &'static str {
        "rev"
    }

    fn usage(&self) -> &'static str {
        "usage: rev\nReverse the characters of every input line."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        loop {
            let line = io.stdin.read_line_bytes().await?;
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let (body, newline) = match text.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (text.as_ref(), ""),
            };
            let reversed: String = body.chars().rev().collect();
            io.stdout
                .write_all(format!("{}{}", reversed, newline).as_bytes())
                .await?;
        }
        Ok(0)
    }
}

/// `wc [-l] [-w] [-c] [FILE...]` — count lines, words and bytes.
pub struct Wc;

#[async_trait]
impl Command for Wc {
    fn name(&self) -> &'static str {
        "wc"
    }

    fn usage(&self) -> &'static str {
        "usage: wc [-l] [-w] [-c] [FILE...]\nCount lines, words and bytes of the input. Default prints all three."
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        let mut lines_flag = false;
        let mut words_flag = false;
        let mut bytes_flag = false;
        let mut files = Vec::new();
        for arg in args {
            match arg.as_str() {
                "-l" => lines_flag = true,
                "-w" => words_flag = true,
                "-c" => bytes_flag = true,
                _ => files.push(arg.clone()),
            }
        }
        if !lines_flag && !words_flag && !bytes_flag {
            lines_flag = true;
            words_flag = true;
            bytes_flag = true;
        }

        let text = read_all_input(io, &files).await?;
        let line_count = text.matches('\n').count();
        let word_count = text.split_whitespace().count();
        let byte_count = text.len();

        let mut fields = Vec::new();
        if lines_flag {
            fields.push(line_count.to_string());
        }
        if words_flag {
            fields.push(word_count.to_string());
        }
        if bytes_flag {
            fields.push(byte_count.to_string());
        }
        io.stdout
            .write_all(format!("{}\n", fields.join(" ")).as_bytes())
            .await?;
        Ok(0)
    }
}
