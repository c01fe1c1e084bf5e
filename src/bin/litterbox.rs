//! litterbox CLI tool
//!
//! Probes the enforcement backends and checks sandbox configurations
//! before they are shipped with a binary.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use litterbox::config::{parse_view, syscalls, PackageId};
use litterbox::{BackendKind, Manifest, NameResolution, Registry, SyscallMask};

/// litterbox - in-process package sandboxing
#[derive(Parser, Debug)]
#[command(name = "litterbox")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which backends this machine supports
    Info,

    /// Parse a memory view such as "self:P,fmt:R"
    CheckView {
        view: String,
    },

    /// Parse a syscall class list such as "io,net"
    CheckSyscalls {
        classes: String,
    },

    /// Load a manifest and print the protection domains of every sandbox
    Plan {
        manifest: PathBuf,

        /// Let short dependency names match "<prefix>.<name>" packages
        #[arg(long)]
        suffix: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn initialize_logging(verbose: u8) {
    let default = match verbose {
        0 => "litterbox=info",
        1 => "litterbox=debug",
        _ => "litterbox=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Command) -> litterbox::Result<()> {
    match command {
        Command::Info => cmd_info(),
        Command::CheckView { view } => cmd_check_view(&view),
        Command::CheckSyscalls { classes } => cmd_check_syscalls(&classes),
        Command::Plan { manifest, suffix } => cmd_plan(&manifest, suffix),
    }
}

fn cmd_info() -> litterbox::Result<()> {
    println!("Sandboxing Backends");
    println!("===================");

    for kind in [BackendKind::Vtx, BackendKind::Mpk, BackendKind::Sim] {
        let status = if kind.is_available() {
            "available"
        } else {
            "not available"
        };
        println!("{:<4} {}", kind.name(), status);
    }
    match litterbox::backend_name() {
        Some(name) => println!("Preferred: {}", name),
        None => println!("Note: neither VT-x (/dev/kvm) nor protection keys are usable."),
    }

    match BackendKind::from_env() {
        Ok(kind) => println!("Selected by environment: {}", kind),
        Err(e) => println!("Selected by environment: {}", e),
    }

    #[cfg(target_arch = "x86_64")]
    println!("Architecture: x86-64");
    #[cfg(not(target_arch = "x86_64"))]
    println!("Architecture: unsupported for hardware backends");

    Ok(())
}

fn cmd_check_view(view: &str) -> litterbox::Result<()> {
    let (entries, pristine) = parse_view(view)?;
    for entry in &entries {
        println!("{:<24} {}", entry.name, entry.prot);
    }
    if pristine {
        println!("(pristine)");
    }
    Ok(())
}

fn cmd_check_syscalls(classes: &str) -> litterbox::Result<()> {
    let mask = SyscallMask::parse(classes)?;
    if mask.is_all() {
        println!("all syscalls allowed");
        return Ok(());
    }
    println!("{} syscalls allowed", mask.count());
    for (i, word) in mask.words().iter().enumerate() {
        println!("  [{}] {:#018x}", i, word);
    }
    println!("classes: {}", syscalls::CLASSES.join(", "));
    Ok(())
}

fn cmd_plan(path: &Path, suffix: bool) -> litterbox::Result<()> {
    let manifest = Manifest::load(path)?;
    let resolution = if suffix {
        NameResolution::Suffix
    } else {
        NameResolution::Exact
    };
    let registry = Registry::from_manifest(&manifest, resolution)?;
    let domains = registry.domains();

    let name = |id: PackageId| {
        registry
            .package(id)
            .map_or_else(|| id.to_string(), |p| p.name.clone())
    };

    println!("{} domains", domains.len());
    for domain in domains.domains() {
        let members: Vec<String> = domains.members(domain).iter().map(|id| name(*id)).collect();
        println!("  domain {}: {}", domain, members.join(", "));
    }
    if !domains.unowned().is_empty() {
        let unowned: Vec<String> = domains.unowned().iter().map(|id| name(*id)).collect();
        println!("  unowned: {}", unowned.join(", "));
    }

    for sandbox in registry.sandboxes() {
        println!("sandbox {}", sandbox.id());
        for (domain, prot) in domains.sandbox(sandbox.id()) {
            println!("  domain {:<6} {}", domain, prot);
        }
        if sandbox.config.sys.is_all() {
            println!("  syscalls: all");
        } else {
            println!("  syscalls: {}", sandbox.config.sys.count());
        }
    }
    Ok(())
}
