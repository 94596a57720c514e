//! ioworker CLI - run single operations through worker processes
//!
//! Usage:
//!   ioworker get <locator> [--output <file>]
//!   ioworker put <file> <locator> [--overwrite] [--resume]
//!   ioworker ls <locator>
//!   ioworker status
//!
//! Examples:
//!   ioworker get file:///etc/hosts
//!   ioworker put notes.txt file:///tmp/notes.txt --overwrite
//!   ioworker ls /var/log

use clap::{Parser, Subcommand};
use ioworker::config::Settings;
use ioworker::protocol::{Entry, EntryKind, Locator};
use ioworker::scheduler::{Job, JobOutput, Scheduler};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ioworker")]
#[command(about = "ioworker - run file operations through out-of-process protocol workers")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the usual search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a resource
    Get {
        /// Locator or local path
        source: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a local file
    Put {
        /// Local file to read
        file: PathBuf,

        /// Destination locator or path
        dest: String,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        resume: bool,

        /// Octal permissions for the new file
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },

    /// Show one entry
    Stat { target: String },

    /// List a directory
    Ls { target: String },

    /// Create a directory
    Mkdir {
        target: String,

        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },

    /// Delete a file, or an empty directory with --dir
    Rm {
        target: String,

        #[arg(long)]
        dir: bool,
    },

    /// Rename within one protocol
    Mv {
        source: String,
        dest: String,

        #[arg(long)]
        overwrite: bool,
    },

    /// Copy within one protocol
    Cp {
        source: String,
        dest: String,

        #[arg(long)]
        overwrite: bool,
    },

    /// Change permissions
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        target: String,
    },

    /// Send a protocol-specific command
    Special {
        target: String,

        /// Raw command bytes, passed as given
        data: String,
    },

    /// Show configured protocols and scheduler state
    Status,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("invalid octal mode '{s}': {e}"))
}

/// Accept either a full locator or a local path.
fn parse_locator(s: &str) -> Result<Locator, String> {
    if s.starts_with('/') || s.starts_with('.') || !s.contains(':') {
        let path = fs::canonicalize(s).unwrap_or_else(|_| PathBuf::from(s));
        return Ok(Locator::file(path));
    }
    s.parse().map_err(|e| format!("invalid locator '{s}': {e}"))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let scheduler = Scheduler::global_with(settings.clone());
    let code = match cli.command {
        Commands::Get { source, output } => cmd_get(&scheduler, &source, output).await,
        Commands::Put {
            file,
            dest,
            overwrite,
            resume,
            mode,
        } => cmd_put(&scheduler, file, &dest, overwrite, resume, mode).await,
        Commands::Stat { target } => cmd_stat(&scheduler, &target).await,
        Commands::Ls { target } => cmd_ls(&scheduler, &target).await,
        Commands::Mkdir { target, mode } => {
            run_simple(&scheduler, &target, |l| Job::mkdir(l, mode)).await
        }
        Commands::Rm { target, dir } => run_simple(&scheduler, &target, |l| Job::delete(l, !dir)).await,
        Commands::Mv {
            source,
            dest,
            overwrite,
        } => run_pair(&scheduler, &source, &dest, |s, d| Job::rename(s, d, overwrite)).await,
        Commands::Cp {
            source,
            dest,
            overwrite,
        } => run_pair(&scheduler, &source, &dest, |s, d| Job::copy(s, d, None, overwrite)).await,
        Commands::Chmod { mode, target } => {
            run_simple(&scheduler, &target, |l| Job::chmod(l, mode)).await
        }
        Commands::Special { target, data } => cmd_special(&scheduler, &target, data).await,
        Commands::Status => cmd_status(&scheduler, &settings).await,
    };

    Scheduler::shutdown_global().await;
    code
}

async fn run_job(scheduler: &Scheduler, job: Job) -> Result<JobOutput, String> {
    let handle = scheduler.submit(job).map_err(|e| e.to_string())?;
    handle.wait().await.map_err(|e| e.to_string())
}

async fn run_simple(scheduler: &Scheduler, target: &str, build: impl FnOnce(Locator) -> Job) -> ExitCode {
    let result = match parse_locator(target) {
        Ok(locator) => run_job(scheduler, build(locator)).await,
        Err(e) => Err(e),
    };
    report(result.map(|_| ()))
}

async fn run_pair(
    scheduler: &Scheduler,
    source: &str,
    dest: &str,
    build: impl FnOnce(Locator, Locator) -> Job,
) -> ExitCode {
    let result = match (parse_locator(source), parse_locator(dest)) {
        (Ok(s), Ok(d)) => run_job(scheduler, build(s, d)).await,
        (Err(e), _) | (_, Err(e)) => Err(e),
    };
    report(result.map(|_| ()))
}

fn report(result: Result<(), String>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_get(scheduler: &Scheduler, source: &str, output: Option<PathBuf>) -> ExitCode {
    let locator = match parse_locator(source) {
        Ok(l) => l,
        Err(e) => return report(Err(e)),
    };
    let fetched = match run_job(scheduler, Job::get(locator)).await {
        Ok(out) => out,
        Err(e) => return report(Err(e)),
    };

    let written = match output {
        Some(path) => fs::write(&path, &fetched.data)
            .map_err(|e| format!("cannot write '{}': {}", path.display(), e)),
        None => std::io::stdout()
            .write_all(&fetched.data)
            .map_err(|e| e.to_string()),
    };
    if let Some(mime) = &fetched.mime_type {
        tracing::debug!(mime = %mime, bytes = fetched.data.len(), "fetched");
    }
    report(written)
}

async fn cmd_put(
    scheduler: &Scheduler,
    file: PathBuf,
    dest: &str,
    overwrite: bool,
    resume: bool,
    mode: Option<u32>,
) -> ExitCode {
    let data = match fs::read(&file) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let locator = match parse_locator(dest) {
        Ok(l) => l,
        Err(e) => return report(Err(e)),
    };

    let result = match scheduler.submit(Job::put(locator, mode, overwrite, resume)) {
        Ok(handle) => handle.upload(data).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    report(result.map(|_| ()))
}

fn print_entry(entry: &Entry) {
    let kind = match entry.kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::Other => '?',
    };
    let mode = entry
        .permissions
        .map(|p| format!("{:04o}", p & 0o7777))
        .unwrap_or_else(|| "----".to_string());
    match &entry.link_dest {
        Some(dest) => println!("{kind} {mode} {:>12} {} -> {}", entry.size, entry.name, dest),
        None => println!("{kind} {mode} {:>12} {}", entry.size, entry.name),
    }
}

async fn cmd_stat(scheduler: &Scheduler, target: &str) -> ExitCode {
    let locator = match parse_locator(target) {
        Ok(l) => l,
        Err(e) => return report(Err(e)),
    };
    match run_job(scheduler, Job::stat(locator)).await {
        Ok(out) => {
            if let Some(entry) = &out.stat {
                print_entry(entry);
                if let Some(mime) = &entry.mime_type {
                    println!("  mime: {}", mime);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => report(Err(e)),
    }
}

async fn cmd_ls(scheduler: &Scheduler, target: &str) -> ExitCode {
    let locator = match parse_locator(target) {
        Ok(l) => l,
        Err(e) => return report(Err(e)),
    };
    match run_job(scheduler, Job::list_dir(locator)).await {
        Ok(mut out) => {
            out.entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in out.entries.iter().filter(|e| e.name != "." && e.name != "..") {
                print_entry(entry);
            }
            ExitCode::SUCCESS
        }
        Err(e) => report(Err(e)),
    }
}

async fn cmd_special(scheduler: &Scheduler, target: &str, data: String) -> ExitCode {
    let locator = match parse_locator(target) {
        Ok(l) => l,
        Err(e) => return report(Err(e)),
    };
    match run_job(scheduler, Job::special(locator, data.into_bytes())).await {
        Ok(out) => {
            for warning in &out.warnings {
                eprintln!("warning: {}", warning);
            }
            if !out.data.is_empty() {
                let _ = std::io::stdout().write_all(&out.data);
            }
            ExitCode::SUCCESS
        }
        Err(e) => report(Err(e)),
    }
}

async fn cmd_status(scheduler: &Scheduler, settings: &Settings) -> ExitCode {
    println!("Scheduler:");
    println!("  max workers:  {}", settings.scheduler.max_workers);
    println!("  idle timeout: {}s", settings.scheduler.idle_timeout_secs);
    println!("  transport:    {}", settings.launcher.transport);

    let mut protocols: Vec<String> = settings.protocols.keys().cloned().collect();
    if !protocols.iter().any(|p| p == "file") {
        protocols.insert(0, "file".to_string());
    }

    println!();
    println!("Protocols:");
    for protocol in &protocols {
        match settings.worker_command(protocol) {
            Ok((program, _)) => println!(
                "  {:<8} cap {}  {}",
                protocol,
                settings.max_workers(protocol),
                program.display()
            ),
            Err(e) => println!("  {:<8} error: {}", protocol, e),
        }
    }

    match scheduler.snapshot().await {
        Ok(snapshot) => {
            println!();
            println!("Live workers: {}", snapshot.workers);
            for (protocol, pool) in &snapshot.pools {
                println!(
                    "  {:<8} active {}  idle {}  queued {}",
                    protocol,
                    pool.active.len(),
                    pool.idle.len(),
                    pool.queued.len()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => report(Err(e.to_string())),
    }
}
