use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Once};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lattice_core::config::VmConfig;
use lattice_core::val::ValKind;
use lattice_core::vm::{ARTIFACT_EXTENSION, Artifact, ArtifactFlags, RuntimeError, Vm, decode, inspect};
use serde::Serialize;
use tracing::{debug, info};


static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "lattice=info,lattice::gc=debug,lattice_cli=info";

#[derive(Debug, Parser)]
#[command(name = "lattice", author, version, about = "Run and inspect compiled Lattice artifacts", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a compiled artifact.
    Run {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Print the disassembly of every chunk in an artifact.
    Disasm {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
    /// Show the container header, sections and metadata.
    Inspect {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Default, clap::Args)]
struct RunOpts {
    /// Enable the cycle collector
    #[arg(long)]
    gc: bool,
    /// Collect on every tracked allocation (implies --gc)
    #[arg(long)]
    gc_stress: bool,
    /// Configuration file (defaults to lattice.toml next to FILE)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Print the program result as JSON
    #[arg(long)]
    json: bool,
}

fn sanitize_path(raw: &str) -> Result<PathBuf> {
    let p = Path::new(raw);
    if p.components().any(|comp| matches!(comp, Component::ParentDir)) {
        bail!("Parent directory components ('..') are not allowed in file paths.");
    }
    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `LATTICE_TRACE=1` uses `RUST_LOG` or the default filter;
/// any other value is taken as the filter itself.
fn maybe_init_tracing() {
    let raw = match std::env::var("LATTICE_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };
    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());
        let builder = fmt().with_writer(std::io::stderr);
        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };
        let _ = builder.try_init();
    });
}

fn script_dir(file: &Path) -> PathBuf {
    match file.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    }
}

/// Flags > environment > config file > defaults.
fn resolve_config(file: &Path, opts: &RunOpts, env: impl Fn(&str) -> Option<String>) -> Result<VmConfig> {
    let dir = script_dir(file);
    let mut config = match &opts.config {
        Some(path) => VmConfig::load(path)?,
        None => VmConfig::discover(&dir)?,
    };
    config.apply_vars(env);
    if opts.gc {
        config.gc.enabled = true;
    }
    if opts.gc_stress {
        config.gc.enabled = true;
        config.gc.stress = true;
    }
    if config.script_dir.is_none() {
        config.script_dir = Some(dir);
    }
    Ok(config)
}

fn read_artifact(file: &Path) -> Result<Artifact> {
    if file.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
        debug!(target: "lattice_cli", file = %file.display(), "artifact.unusual_extension");
    }
    Artifact::read_file(file).with_context(|| format!("Failed to load artifact '{}'", file.display()))
}

fn run_file(file: &Path, opts: &RunOpts) -> Result<()> {
    let artifact = read_artifact(file)?;
    let config = resolve_config(file, opts, |key| std::env::var(key).ok())?;
    info!(
        target: "lattice_cli",
        file = %file.display(),
        gc = config.gc.enabled,
        stress = config.gc.stress,
        "run"
    );

    let registry = lattice_stdlib::default_registry()?;
    let mut vm = Vm::with_config(Arc::new(registry), &config);
    let result = vm.run_artifact(artifact)?;

    if opts.json {
        println!("{}", serde_json::to_string(&result)?);
    } else if !matches!(result.kind, ValKind::Nil | ValKind::Unit) {
        println!("{result}");
    }
    if config.gc.enabled {
        let stats = vm.gc().stats();
        debug!(target: "lattice::gc", cycles = stats.cycles, freed = stats.total_freed, "gc.summary");
    }
    Ok(())
}

fn disasm_file(file: &Path) -> Result<()> {
    let artifact = read_artifact(file)?;
    print!("{}", artifact.entry);
    for module in &artifact.modules {
        println!();
        println!("-- module {} --", module.path);
        print!("{}", module.artifact.entry);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectReport {
    file: String,
    version: u16,
    flags: Vec<&'static str>,
    sections: Vec<SectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<lattice_core::vm::ArtifactMeta>,
    entry: String,
    functions: usize,
    modules: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SectionReport {
    tag: String,
    bytes: usize,
}

fn flag_names(flags: ArtifactFlags) -> Vec<&'static str> {
    [(ArtifactFlags::DEBUG_INFO, "debug_info"), (ArtifactFlags::INT_FAST_PATHS, "int_fast_paths")]
        .into_iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| name)
        .collect()
}

fn count_functions(chunk: &lattice_core::vm::Chunk) -> usize {
    1 + chunk.protos.iter().map(|p| count_functions(p)).sum::<usize>()
}

fn inspect_report(file: &Path) -> Result<InspectReport> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read '{}'", file.display()))?;
    let header = inspect(&bytes)?;
    let artifact = decode(&bytes)?;
    Ok(InspectReport {
        file: file.display().to_string(),
        version: header.version,
        flags: flag_names(header.flags),
        sections: header
            .sections
            .into_iter()
            .map(|(tag, bytes)| SectionReport { tag, bytes })
            .collect(),
        meta: artifact.meta.clone(),
        entry: artifact.entry.name.to_string(),
        functions: count_functions(&artifact.entry),
        modules: artifact.modules.iter().map(|m| m.path.clone()).collect(),
    })
}

fn inspect_file(file: &Path, json: bool) -> Result<()> {
    let report = inspect_report(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("file:      {}", report.file);
    println!("version:   {}", report.version);
    let flags = if report.flags.is_empty() { "none".to_string() } else { report.flags.join(", ") };
    println!("flags:     {flags}");
    println!("entry:     {} ({} functions)", report.entry, report.functions);
    println!("sections:");
    for section in &report.sections {
        println!("  {:<6}{} bytes", section.tag, section.bytes);
    }
    if let Some(meta) = &report.meta {
        println!("meta:");
        if let Some(source) = &meta.source {
            println!("  source:   {source}");
        }
        if let Some(compiler) = &meta.compiler {
            println!("  compiler: {compiler}");
        }
        for (key, value) in &meta.tags {
            println!("  {key} = {value}");
        }
    }
    if !report.modules.is_empty() {
        println!("modules:");
        for path in &report.modules {
            println!("  {path}");
        }
    }
    Ok(())
}

/// `Error: ...`; engine failures carry their stack trace.
fn error_report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<RuntimeError>() {
        Some(runtime) => format!("Error: {}", runtime.report()),
        None => format!("Error: {err:#}"),
    }
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run { file, opts } => run_file(&file, &opts),
        Commands::Disasm { file } => disasm_file(&file),
        Commands::Inspect { file, json } => inspect_file(&file, json),
    }
}

fn main() -> ExitCode {
    maybe_init_tracing();
    let CliArgs { command } = CliArgs::parse();
    match dispatch(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", error_report(&err));
            ExitCode::FAILURE
        }
    }
}
