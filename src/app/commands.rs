//! Command processing
//!
//! Commands are data: an identifier, aliases, a help line and a handler.
//! Front ends parse a line with [`parse_command`] and dispatch it through
//! [`CommandTable::execute`].

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

use super::context::Session;
use crate::debug::LiveTarget;
use crate::engine::PollOutcome;

/// Arguments handed to a command handler
pub struct Invocation<'a> {
    /// Text after the command word, trimmed
    pub arg: Option<&'a str>,
    /// The live process, when one is being debugged
    pub target: Option<&'a mut dyn LiveTarget>,
}

/// Handler output: lines to show the user
pub type CommandOutput = Vec<String>;

pub type CommandHandler = Box<dyn Fn(&mut Session, Invocation<'_>) -> Result<CommandOutput>>;

pub struct CommandSpec {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    pub help: &'static str,
    /// Only usable while a host supplies a live process
    pub needs_target: bool,
    handler: CommandHandler,
}

/// Parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand<'a> {
    Run { name: &'a str, arg: Option<&'a str> },
    Help,
    Quit,
    Empty,
}

/// Split a command line into the command word and its argument
pub fn parse_command(input: &str) -> ParsedCommand<'_> {
    let input = input.trim();
    let mut parts = input.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match cmd {
        "" => ParsedCommand::Empty,
        "help" | "?" => ParsedCommand::Help,
        "quit" | "exit" | "q" => ParsedCommand::Quit,
        name => ParsedCommand::Run { name, arg },
    }
}

/// Parse an address from hex or decimal string
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.chars().all(|c| c.is_ascii_hexdigit()) && s.len() > 4 {
        u64::from_str_radix(s, 16).ok()
    } else {
        s.parse().ok()
    }
}

pub struct CommandTable {
    commands: BTreeMap<&'static str, CommandSpec>,
}

impl CommandTable {
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Table with every built-in command registered
    pub fn new() -> Self {
        let mut table = Self::empty();
        table.register("enable", &["on"], "Enable patching of started processes", Box::new(cmd_enable));
        table.register("disable", &["off"], "Disable patching of started processes", Box::new(cmd_disable));
        table.register_live("apply", &["a"], "Apply cached patches to the current process [group]", Box::new(cmd_apply));
        table.register("rescan", &["scan", "r"], "Rescan the static patch database now", Box::new(cmd_rescan));
        table.register("status", &["st"], "Show session status", Box::new(cmd_status));
        table.register("regions", &["ls"], "List cached patch regions", Box::new(cmd_regions));
        table.register("groups", &["g"], "List patch groups", Box::new(cmd_groups));
        table.register("capture", &[], "Save cached regions as patch group <name>", Box::new(cmd_capture));
        table.register("patchpoint", &["pp"], "Set primary patch address <addr|none>", Box::new(cmd_patch_point));
        table.register("about", &["version"], "About this tool", Box::new(cmd_about));
        table
    }

    pub fn register(
        &mut self,
        id: &'static str,
        aliases: &'static [&'static str],
        help: &'static str,
        handler: CommandHandler,
    ) {
        self.insert(id, aliases, help, false, handler);
    }

    /// Register a command that needs a live process
    pub fn register_live(
        &mut self,
        id: &'static str,
        aliases: &'static [&'static str],
        help: &'static str,
        handler: CommandHandler,
    ) {
        self.insert(id, aliases, help, true, handler);
    }

    fn insert(
        &mut self,
        id: &'static str,
        aliases: &'static [&'static str],
        help: &'static str,
        needs_target: bool,
        handler: CommandHandler,
    ) {
        self.commands.insert(
            id,
            CommandSpec {
                id,
                aliases,
                help,
                needs_target,
                handler,
            },
        );
    }

    /// Look up a command by identifier or alias
    pub fn find(&self, name: &str) -> Option<&CommandSpec> {
        self.commands
            .get(name)
            .or_else(|| self.commands.values().find(|c| c.aliases.iter().any(|a| *a == name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    /// Commands usable by a front end with or without a live process
    pub fn available(&self, has_target: bool) -> impl Iterator<Item = &CommandSpec> {
        self.commands
            .values()
            .filter(move |c| has_target || !c.needs_target)
    }

    pub fn execute(
        &self,
        session: &mut Session,
        name: &str,
        invocation: Invocation<'_>,
    ) -> Result<CommandOutput> {
        let spec = self
            .find(name)
            .ok_or_else(|| anyhow!("Unknown command: {}. Type 'help' for available commands.", name))?;
        if spec.needs_target && invocation.target.is_none() {
            bail!("`{}` only works while a process is being debugged", spec.id);
        }
        log::debug!("Executing command [{}]", spec.id);
        (spec.handler)(session, invocation)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

fn cmd_enable(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    session.set_enabled(true)?;
    Ok(vec!["Patching enabled.".into()])
}

fn cmd_disable(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    session.set_enabled(false)?;
    Ok(vec!["Patching disabled.".into()])
}

fn cmd_apply(session: &mut Session, inv: Invocation<'_>) -> Result<CommandOutput> {
    let Some(target) = inv.target else {
        bail!("No process is being debugged");
    };

    if let Some(group) = inv.arg {
        if !target.suspend_target() {
            bail!("Could not suspend process");
        }
        let result = session.apply_group(target, group);
        target.resume_target();
        let report = result?;
        return Ok(vec![format!(
            "Group [{}]: {} regions / {} bytes written",
            group, report.regions_applied, report.bytes_written
        )]);
    }

    match session.apply_to_current_process(target) {
        Some(Ok(report)) => {
            let mut out = vec![format!(
                "{} regions / {} bytes written",
                report.regions_applied, report.bytes_written
            )];
            out.extend(report.shortfalls.iter().map(|s| {
                format!(
                    "  short write at 0x{:x}: {}/{} bytes",
                    s.start_address, s.written, s.expected
                )
            }));
            Ok(out)
        }
        Some(Err(e)) => bail!("Patches not applied: {}", e),
        None => bail!("Could not suspend process"),
    }
}

fn cmd_rescan(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    match session.rescan() {
        PollOutcome::Refreshed { regions, bytes } => {
            Ok(vec![format!("{} regions / {} bytes cached", regions, bytes)])
        }
        PollOutcome::Skipped(reason) => Ok(vec![format!("Scan skipped: {:?}", reason)]),
        PollOutcome::Failed(e) => bail!("Scan failed: {}", e),
    }
}

fn cmd_status(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    let snapshot = session.snapshot();
    let status = session.status();
    Ok(vec![
        format!("Patching:      {}", if session.is_enabled() { "enabled" } else { "disabled" }),
        format!("Debugger:      {}", if status.is_debugger_attached() { "attached" } else { "detached" }),
        format!("Gate:          {:?} ({} starts)", session.gate().state(), session.gate().starts()),
        format!("Poller:        {}", if session.is_polling() { "running" } else { "stopped" }),
        format!("Cached:        {} regions / {} bytes", snapshot.len(), snapshot.total_bytes()),
        format!(
            "Patch point:   {}",
            session
                .settings()
                .primary_patch_address
                .map(|a| format!("0x{:x}", a))
                .unwrap_or_else(|| "entry".into())
        ),
    ])
}

fn cmd_regions(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    let snapshot = session.snapshot();
    if snapshot.is_empty() {
        return Ok(vec!["No patched bytes cached.".into()]);
    }
    Ok(snapshot.regions().iter().map(ToString::to_string).collect())
}

fn cmd_groups(session: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    Ok(session
        .groups()
        .iter()
        .map(|(name, group)| {
            format!(
                "{:<16} {:<8} {} regions / {} bytes",
                name,
                if group.enabled { "enabled" } else { "disabled" },
                group.regions.len(),
                group.total_bytes()
            )
        })
        .collect())
}

fn cmd_capture(session: &mut Session, inv: Invocation<'_>) -> Result<CommandOutput> {
    let name = inv.arg.ok_or_else(|| anyhow!("capture requires a group name"))?;
    let regions = session.capture_group(name)?;
    Ok(vec![format!("Group [{}] now holds {} regions", name, regions)])
}

fn cmd_patch_point(session: &mut Session, inv: Invocation<'_>) -> Result<CommandOutput> {
    let arg = inv.arg.ok_or_else(|| anyhow!("patchpoint requires an address or 'none'"))?;
    let address = match arg {
        "none" | "entry" => None,
        text => Some(parse_address(text).ok_or_else(|| anyhow!("Invalid address: {}", text))?),
    };
    session.set_primary_patch_address(address)?;
    Ok(vec![match address {
        Some(a) => format!("Primary patch address set to 0x{:x}", a),
        None => "Primary patch address cleared".into(),
    }])
}

fn cmd_about(_: &mut Session, _: Invocation<'_>) -> Result<CommandOutput> {
    Ok(vec![
        format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        "Reapplies statically patched bytes to every debugged process start.".into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::context::SessionConfig;
    use crate::debug::sim::{SimPatchDb, SimTarget};
    use crate::debug::SessionFlags;
    use std::sync::Arc;

    fn no_target(arg: Option<&str>) -> Invocation<'_> {
        Invocation { arg, target: None }
    }

    fn session(dir: &std::path::Path) -> Session {
        let db = Arc::new(SimPatchDb::new());
        db.patch(0x1000, &[0xAA, 0xBB], &[0x11, 0x22]);
        let mut config = SessionConfig::new(dir.join("settings.json"));
        config.background_poll = false;
        Session::start(config, db, Arc::new(SessionFlags::new())).unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  "), ParsedCommand::Empty);
        assert_eq!(parse_command("help"), ParsedCommand::Help);
        assert_eq!(parse_command("q"), ParsedCommand::Quit);
        assert_eq!(
            parse_command("capture  hooks "),
            ParsedCommand::Run {
                name: "capture",
                arg: Some("hooks")
            }
        );
        assert_eq!(
            parse_command("status"),
            ParsedCommand::Run {
                name: "status",
                arg: None
            }
        );
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x1000"), Some(0x1000));
        assert_eq!(parse_address("0X1f"), Some(0x1f));
        assert_eq!(parse_address("401000"), Some(0x401000));
        assert_eq!(parse_address("1234"), Some(1234));
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_aliases_resolve() {
        let table = CommandTable::new();
        assert_eq!(table.find("off").map(|c| c.id), Some("disable"));
        assert_eq!(table.find("regions").map(|c| c.id), Some("regions"));
        assert!(table.find("decompile").is_none());
    }

    #[test]
    fn test_live_commands_hidden_without_target() {
        let table = CommandTable::new();
        assert!(table.available(false).all(|c| c.id != "apply"));
        assert!(table.available(true).any(|c| c.id == "apply"));
        assert!(table.available(false).any(|c| c.id == "status"));

        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let err = table.execute(&mut session, "a", no_target(None)).unwrap_err();
        assert!(err.to_string().contains("only works while a process is being debugged"));
    }

    #[test]
    fn test_enable_disable_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let table = CommandTable::new();

        table.execute(&mut session, "disable", no_target(None)).unwrap();
        assert!(!session.is_enabled());
        table.execute(&mut session, "on", no_target(None)).unwrap();
        assert!(session.is_enabled());
    }

    #[test]
    fn test_regions_lists_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let out = CommandTable::new()
            .execute(&mut session, "regions", no_target(None))
            .unwrap();
        assert_eq!(out, vec!["0x1000 [2 bytes] AABB -> 1122".to_string()]);
    }

    #[test]
    fn test_apply_needs_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let table = CommandTable::new();
        assert!(table.execute(&mut session, "apply", no_target(None)).is_err());

        let mut target = SimTarget::new().with_memory(0x1000, &[0xAA, 0xBB]);
        let out = table
            .execute(
                &mut session,
                "apply",
                Invocation {
                    arg: None,
                    target: Some(&mut target),
                },
            )
            .unwrap();
        assert_eq!(out[0], "1 regions / 2 bytes written");
        assert_eq!(target.peek_range(0x1000, 2), vec![Some(0x11), Some(0x22)]);
        assert_eq!(target.resume_calls(), 1);
    }

    #[test]
    fn test_patch_point_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let table = CommandTable::new();

        table
            .execute(&mut session, "pp", no_target(Some("0x401000")))
            .unwrap();
        assert_eq!(session.settings().primary_patch_address, Some(0x401000));
        assert!(table.execute(&mut session, "pp", no_target(Some("junk"))).is_err());
        assert!(table.execute(&mut session, "frobnicate", no_target(None)).is_err());
    }

    #[test]
    fn test_custom_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path());
        let mut table = CommandTable::empty();
        table.register(
            "count",
            &[],
            "Count regions",
            Box::new(|s: &mut Session, _: Invocation<'_>| Ok(vec![s.snapshot().len().to_string()])),
        );
        let out = table.execute(&mut session, "count", no_target(None)).unwrap();
        assert_eq!(out, vec!["1".to_string()]);
    }
}
