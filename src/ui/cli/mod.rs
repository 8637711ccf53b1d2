//! CLI - reedline-based REPL interface
//!
//! Line editing and history come from reedline; every command is
//! dispatched through the session's [`CommandTable`].

use anyhow::Result;
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;

use crate::app::{parse_command, CommandTable, Invocation, ParsedCommand, Session};
use crate::patch::PatchRegion;

/// Prompt showing whether patching is on and how many regions are cached
pub struct AutopatchPrompt {
    enabled: bool,
    regions: usize,
}

impl AutopatchPrompt {
    pub fn new() -> Self {
        Self {
            enabled: true,
            regions: 0,
        }
    }

    /// Refresh the prompt from the session state
    pub fn update(&mut self, session: &Session) {
        self.enabled = session.is_enabled();
        self.regions = session.snapshot().len();
    }
}

impl Default for AutopatchPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for AutopatchPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = if self.enabled { "on" } else { "off" };
        Cow::Owned(format!("[{}:{}]", status, self.regions))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Print the help message. Commands needing a live process are listed
/// only when `has_target` is set.
pub fn print_help(table: &CommandTable, has_target: bool) {
    println!("{}", "Autopatch Commands".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    for spec in table.available(has_target) {
        let aliases = if spec.aliases.is_empty() {
            String::new()
        } else {
            format!(" ({})", spec.aliases.join(", "))
        };
        println!("  {:<24} {}", format!("{}{}", spec.id, aliases).green(), spec.help);
    }

    println!("\n{}", "Other:".bold().yellow());
    println!("  {:<24} Show this help", "?".green());
    println!("  {:<24} Quit", "q".green());
}

/// Print consolidated regions, one per line
pub fn print_regions(regions: &[PatchRegion]) {
    if regions.is_empty() {
        println!("{}", "No patched bytes found.".dimmed());
        return;
    }
    for region in regions {
        println!(
            "  {} {:>5} bytes  {} -> {}",
            format!("{:#010x}", region.start_address()).yellow(),
            region.len(),
            hex::encode_upper(region.original_bytes()).red(),
            hex::encode_upper(region.patched_bytes()).green()
        );
    }
}

/// Run one REPL line. Returns false when the user asked to quit.
pub fn handle_line(session: &mut Session, table: &CommandTable, line: &str) -> bool {
    match parse_command(line) {
        ParsedCommand::Empty => {}
        ParsedCommand::Help => print_help(table, false),
        ParsedCommand::Quit => return false,
        ParsedCommand::Run { name, arg } => {
            let invocation = Invocation { arg, target: None };
            match table.execute(session, name, invocation) {
                Ok(lines) => {
                    for line in lines {
                        println!("{}", line);
                    }
                }
                Err(e) => println!("{} {:#}", "[!]".red(), e),
            }
        }
    }
    true
}

/// Run the CLI REPL
pub fn run_cli(session: &mut Session, table: &CommandTable) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = AutopatchPrompt::new();

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  Autopatch CLI - Type '?' for help, 'q' to quit              ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    loop {
        prompt.update(session);
        match line_editor.read_line(&prompt)? {
            Signal::Success(buffer) => {
                if !handle_line(session, table, &buffer) {
                    println!("[*] Shutting down...");
                    break;
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                break;
            }
        }
    }

    Ok(())
}
