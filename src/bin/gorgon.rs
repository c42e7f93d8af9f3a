//! gorgon - load, configure, disassemble and save a binary
//!
//! Usage:
//!   gorgon <binary>                          Disassemble with the proposed architecture
//!   gorgon <binary> --arch capstone --set mode=x86-32
//!   gorgon <binary> --describe               Print the architecture options as JSON
//!   gorgon <binary> --save out.json          Save the database after disassembly

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gorgon::architecture::CapstoneArchitecture;
use gorgon::disassembler::{DisassemblyOptions, Traversal};
use gorgon::format::OutputFormat;
use gorgon::loader::{GoblinLoader, RawLoader};
use gorgon::serialize::JsonSerializer;
use gorgon::session::{Registry, Session};
use gorgon::LogEventHandler;

#[derive(Parser, Debug)]
#[command(name = "gorgon")]
#[command(about = "A disassembler built on a queryable cell database", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the binary file
    binary: PathBuf,

    /// Loader to map the input with (default: first one recognizing it)
    #[arg(short, long)]
    loader: Option<String>,

    /// Architecture to decode with (default: the loader's proposal)
    #[arg(short, long)]
    arch: Option<String>,

    /// Architecture option assignment, e.g. `mode=x86-32` (repeatable)
    #[arg(short, long = "set", value_name = "NAME=VALUE")]
    settings: Vec<String>,

    /// Which discovered addresses to decode
    #[arg(short, long, value_enum, default_value_t = Traversal::Recursive)]
    traversal: Traversal,

    /// Listing format written to stdout
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Save the database to this store after disassembly
    #[arg(long)]
    save: Option<String>,

    /// Print the configuration model as JSON and stop
    #[arg(long)]
    describe: bool,

    /// Log every cell the disassembly pass updates (visible with RUST_LOG=debug)
    #[arg(long)]
    events: bool,

    /// Load address used by the raw loader
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    raw_base: u64,

    /// Address width in bits used by the raw loader
    #[arg(long, default_value_t = 32)]
    raw_bits: u8,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let data = fs::read(&cli.binary)
        .with_context(|| format!("Failed to read binary: {}", cli.binary.display()))?;

    let registry = Registry::new()
        .with_loader(GoblinLoader::new())
        .with_loader(RawLoader::new(cli.raw_base, cli.raw_bits))
        .with_architecture(CapstoneArchitecture::default());
    let mut session = Session::new(registry);

    session
        .map(cli.loader.as_deref(), &data)
        .with_context(|| format!("Failed to map {}", cli.binary.display()))?;
    session.choose_architecture(cli.arch.as_deref()).context("Failed to choose an architecture")?;
    let model = session.configuration_model_mut()?;
    for assignment in &cli.settings {
        model
            .apply_assignment(assignment)
            .with_context(|| format!("Rejected option {}", assignment))?;
    }

    if cli.describe {
        let description = serde_json::to_string_pretty(&session.configuration_model().describe())?;
        println!("{}", description);
        return Ok(());
    }

    session.configure()?;
    let options = DisassemblyOptions {
        traversal: cli.traversal,
        ..DisassemblyOptions::default()
    };
    let report = if cli.events {
        session.disassemble_observed(&options, Box::new(LogEventHandler))?
    } else {
        session.disassemble(&options)?
    };
    log::info!("{}: {}", cli.traversal, report);

    print!("{}", cli.format.render(session.database())?);

    if let Some(store) = &cli.save {
        session
            .save(&JsonSerializer, store)
            .with_context(|| format!("Failed to save database to {}", store))?;
    }
    session.close()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
