//! The help command: the help catalogue behind the command contract.

use async_trait::async_trait;

use super::{Command, CommandIo, complain, wants_help};
use crate::Result;
use crate::help;

/// `help KEY...` — print the usage guides for 1–11 topic keys.
pub struct Help;

#[async_trait]
impl Command for Help {
    fn name(&self) -> &'static str {
        "help"
    }

    fn usage(&self) -> &'static str {
        "usage: help KEY...\nPrint the usage guides for between 1 and 11 topic keys:\nbasic_operations, data_analysis, text_processing, file_operations,\ncontent_search, format_conversion, log_analysis, batch_processing,\ninteractive_workflow, debugging, command_usage"
    }

    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32> {
        if wants_help(args, self.usage(), io).await? {
            return Ok(0);
        }

        match help::lookup(args) {
            Ok(text) => {
                io.stdout.write_all(text.as_bytes()).await?;
                Ok(0)
            }
            Err(e) => {
                complain(io, "help", &e.to_string()).await?;
                Ok(2)
            }
        }
    }
}
