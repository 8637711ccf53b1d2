//! Autopatch - entry point
//!
//! Handles CLI argument parsing and dispatches to the one-shot scan, the
//! ptrace runner or the interactive REPL.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use autopatch::app::{CommandTable, Session, SessionConfig, Settings};
use autopatch::db::{ImageLayout, RecordDb};
use autopatch::debug::{DebugStatus, SessionFlags, StaticPatchSource};
use autopatch::patch::groups::PatchGroupDb;
use autopatch::patch::{consolidate, scan_static_patches};
use autopatch::ui::cli::{print_regions, run_cli};

/// Autopatch: keep static byte patches applied across debug sessions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (defaults to $AUTOPATCH_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct PatchSource {
    /// Patch record file written by the patch editor
    #[arg(short, long)]
    patches: PathBuf,

    /// Program image used to resolve file offsets
    #[arg(short, long)]
    image: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the patch records once and print the consolidated regions
    Scan {
        #[command(flatten)]
        source: PatchSource,
    },

    /// Run a program under ptrace and patch it on every exec
    Run {
        #[command(flatten)]
        source: PatchSource,

        /// Only scan once at startup
        #[arg(long, default_value_t = false)]
        no_poll: bool,

        /// Program to run
        program: PathBuf,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Interactive session over the command table
    Repl {
        #[command(flatten)]
        source: PatchSource,
    },
}

fn main() -> Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::info!("Autopatch v{} initialized", env!("CARGO_PKG_VERSION"));
    let settings_path = args.config.unwrap_or_else(Settings::default_path);
    log::debug!("Settings: {}", settings_path.display());

    // 3. Branch based on subcommand
    match args.command {
        Command::Scan { source } => scan(&source),
        Command::Repl { source } => repl(&source, settings_path),
        Command::Run {
            source,
            no_poll,
            program,
            args,
        } => {
            let code = run(&source, settings_path, no_poll, &program, &args)?;
            std::process::exit(code);
        }
    }
}

fn open_source(source: &PatchSource) -> Result<RecordDb> {
    let layout = match &source.image {
        Some(path) => {
            let layout = ImageLayout::from_file(path)
                .with_context(|| format!("Failed to parse image {}", path.display()))?;
            log::info!("{}", layout.summary());
            Some(layout)
        }
        None => None,
    };
    Ok(RecordDb::new(&source.patches, layout))
}

fn session_config(source: &PatchSource, settings_path: PathBuf) -> SessionConfig {
    let mut config = SessionConfig::new(settings_path);
    config.group_db_path = source.image.as_deref().map(PatchGroupDb::path_for_image);
    config
}

/// Session over the record file, sharing `flags` with the live host
fn start_session(
    source: &PatchSource,
    settings_path: PathBuf,
    background_poll: bool,
    flags: &Arc<SessionFlags>,
) -> Result<Session> {
    let db: Arc<dyn StaticPatchSource> = Arc::new(open_source(source)?);
    let status: Arc<dyn DebugStatus> = flags.clone();
    let mut config = session_config(source, settings_path);
    config.background_poll = background_poll;
    Session::start(config, db, status)
}

fn scan(source: &PatchSource) -> Result<()> {
    let db = open_source(source)?;
    let outcome = scan_static_patches(&db)
        .with_context(|| format!("Failed to scan {}", source.patches.display()))?;
    let regions = consolidate(&outcome.edits);

    println!("{}", format!("Patch records: {}", source.patches.display()).bold().cyan());
    print_regions(&regions);
    println!(
        "\n[{}] regions / [{}] bytes ({} skipped, {} duplicates)",
        regions.len(),
        outcome.total_bytes(),
        outcome.skipped,
        outcome.duplicates
    );
    Ok(())
}

fn repl(source: &PatchSource, settings_path: PathBuf) -> Result<()> {
    let flags = Arc::new(SessionFlags::new());
    let mut session = start_session(source, settings_path, true, &flags)?;

    println!("[*] Autopatch v{} - {} regions cached", env!("CARGO_PKG_VERSION"), session.snapshot().len());
    let result = run_cli(&mut session, &CommandTable::new());
    session.term();
    result
}

#[cfg(target_os = "linux")]
fn run(
    source: &PatchSource,
    settings_path: PathBuf,
    no_poll: bool,
    program: &Path,
    args: &[String],
) -> Result<i32> {
    use autopatch::debug::linux::{PtraceTarget, TargetEvent};

    let flags = Arc::new(SessionFlags::new());
    let mut session = start_session(source, settings_path, !no_poll, &flags)?;

    let mut target = PtraceTarget::spawn(program, args, flags)?;
    loop {
        match target.wait_event()? {
            TargetEvent::Started(start) => {
                let outcome = session.on_process_start(&start, &mut target);
                match &outcome.result {
                    Some(Ok(report)) => println!(
                        "{} pid {} at {:#x}: {} regions / {} bytes patched",
                        "[+]".green(),
                        start.pid,
                        outcome.patch_point,
                        report.regions_applied,
                        report.bytes_written
                    ),
                    Some(Err(e)) => println!("{} pid {}: not patched ({})", "[-]".yellow(), start.pid, e),
                    None => println!("{} pid {}: could not suspend", "[!]".red(), start.pid),
                }
                if log::log_enabled!(log::Level::Debug) {
                    verify_patches(&session, &mut target);
                }
            }
            TargetEvent::Exited(code) => {
                session.on_process_exit();
                return Ok(code);
            }
            TargetEvent::Signaled(signal) => {
                session.on_process_exit();
                return Ok(128 + signal as i32);
            }
        }
    }
}

/// Read the patched regions back from the live image
#[cfg(target_os = "linux")]
fn verify_patches(session: &Session, target: &mut autopatch::debug::linux::PtraceTarget) {
    for region in session.snapshot().regions() {
        match target.read_memory(region.start_address(), region.len()) {
            Some(live) if live == region.patched_bytes() => {
                log::debug!("Verified {:#x} [{} bytes]", region.start_address(), region.len())
            }
            Some(live) => log::debug!(
                "Mismatch at {:#x}: live {} expected {}",
                region.start_address(),
                hex::encode_upper(&live),
                hex::encode_upper(region.patched_bytes())
            ),
            None => log::debug!("Cannot read back {:#x}", region.start_address()),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(
    _source: &PatchSource,
    _settings_path: PathBuf,
    _no_poll: bool,
    _program: &Path,
    _args: &[String],
) -> Result<i32> {
    anyhow::bail!("`run` needs ptrace and is only available on Linux")
}
