use std::cell::Cell;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use ariadne::{Color, Label, Report, ReportKind, Source};
use blockflow::{FileStorage, FlowError, Runtime, RuntimeConfig};
use clap::{Parser, Subcommand};
use serde_json::Value as Json;

#[derive(Parser)]
#[command(name = "blockflow")]
#[command(about = "Run and check blockflow graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a flow file and run it
    Run {
        /// Path to the flow JSON
        file: PathBuf,
        /// Runtime settings (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Panic on access through destroyed blocks
        #[arg(long)]
        strict: bool,
        /// Maximum drain passes
        #[arg(long, default_value_t = 100)]
        ticks: usize,
        /// Advance the virtual clock by this many milliseconds after the first drain
        #[arg(long)]
        advance_ms: Option<u64>,
        /// Wait for timers on the wall clock for up to this many milliseconds
        #[arg(long)]
        realtime: Option<u64>,
        /// Directory for persisted flow state (loaded on start, saved on exit)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Flow files registered as functions, named after the file stem
        #[arg(long = "lib")]
        libs: Vec<PathBuf>,
    },
    /// Validate a flow file without running it
    Check {
        /// Path to the flow JSON
        file: PathBuf,
    },
    /// Print the registered function descriptors
    Functions,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            strict,
            ticks,
            advance_ms,
            realtime,
            state,
            libs,
        } => {
            let mut config = match config {
                Some(path) => RuntimeConfig::from_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => RuntimeConfig::default(),
            };
            config.strict |= strict;
            let options = RunOptions { ticks, advance_ms, realtime, state, libs };
            run_file(&file, config, options)
        }
        Commands::Check { file } => check_file(&file),
        Commands::Functions => print_functions(),
    }
}

struct RunOptions {
    ticks: usize,
    advance_ms: Option<u64>,
    realtime: Option<u64>,
    state: Option<PathBuf>,
    libs: Vec<PathBuf>,
}

fn flow_name(file: &Path) -> anyhow::Result<String> {
    file.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .with_context(|| format!("no flow name in {}", file.display()))
}

fn read_json(file: &Path) -> anyhow::Result<Json> {
    let source = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&source).with_context(|| format!("parsing {}", file.display()))
}

fn run_file(file: &Path, config: RuntimeConfig, options: RunOptions) -> anyhow::Result<()> {
    let mut rt = Runtime::new(config);
    for lib in &options.libs {
        let id = flow_name(lib)?;
        let key = rt.register_flow_function(&id, read_json(lib)?, None)?;
        log::info!("registered '{key}' from {}", lib.display());
    }

    let name = flow_name(file)?;
    let data = read_json(file)?;
    let flow = rt.add_flow(&name, &data).with_context(|| format!("loading flow '{name}'"))?;
    if let Some(dir) = &options.state {
        rt.set_storage(FileStorage::new(dir));
        match rt.load_flow_from_storage(&name) {
            Ok(_) => eprintln!("Loaded state from: {}", dir.display()),
            Err(FlowError::NotFound(_)) => {}
            Err(error) => return Err(anyhow::Error::new(error).context("loading saved state")),
        }
    }

    rt.run_all(options.ticks);
    if let Some(ms) = options.advance_ms {
        rt.advance_time(ms);
    }
    if let Some(ms) = options.realtime {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("starting timer runtime")?;
        runtime.block_on(run_realtime(&mut rt, Duration::from_millis(ms), options.ticks));
    }
    if rt.has_pending() {
        log::warn!("work still pending after {} passes", options.ticks);
    }

    let values = rt.deep_view(flow).snapshot().to_json().unwrap_or(Json::Null);
    println!("{}", serde_json::to_string_pretty(&values)?);

    if let Some(dir) = &options.state {
        rt.save_flow(&name).context("saving state")?;
        eprintln!("Saved state to: {}", dir.display());
    }
    Ok(())
}

/// Drive timers on the wall clock until none remain or `budget` runs out.
async fn run_realtime(rt: &mut Runtime, budget: Duration, passes: usize) {
    let scheduled = Rc::new(Cell::new(false));
    let flag = scheduled.clone();
    rt.set_schedule_hook(move || flag.set(true));

    let deadline = Instant::now() + budget;
    loop {
        if scheduled.replace(false) || rt.has_pending() {
            rt.run_all(passes);
        }
        let Some(next) = rt.time_to_next_timer() else {
            break;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = Duration::from_millis(next).min(remaining);
        let started = Instant::now();
        tokio::time::sleep(wait).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        rt.advance_time(elapsed);
    }
}

fn check_file(file: &Path) -> anyhow::Result<()> {
    eprintln!("Checking: {}", file.display());
    let source = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let filename = file.display().to_string();

    let data: Json = match serde_json::from_str(&source) {
        Ok(data) => data,
        Err(error) => {
            let at = offset_of(&source, error.line(), error.column());
            report(&filename, &source, "invalid JSON", at..at, &error.to_string());
            bail!("{} is not valid JSON", file.display());
        }
    };

    let name = flow_name(file)?;
    let mut rt = Runtime::default();
    match rt.add_flow(&name, &data) {
        Ok(flow) => {
            let blocks = rt.block_count();
            eprintln!("OK: '{name}' loads as {flow:?} ({blocks} blocks)");
            Ok(())
        }
        Err(error) => {
            let span = match &error {
                FlowError::InvalidPath { path, .. } => locate(&source, path, error.span()),
                _ => None,
            };
            match span {
                Some(span) => report(&filename, &source, "invalid binding path", span, &error.to_string()),
                None => eprintln!("Error: {error}"),
            }
            bail!("{} does not load", file.display());
        }
    }
}

/// Byte offset of a 1-based line and column.
fn offset_of(source: &str, line: usize, column: usize) -> usize {
    let start: usize = source.lines().take(line.saturating_sub(1)).map(|l| l.len() + 1).sum();
    (start + column.saturating_sub(1)).min(source.len())
}

/// Map a span inside a path string to the file, using the first quoted
/// occurrence of that path.
fn locate(source: &str, path: &str, span: Option<Range<usize>>) -> Option<Range<usize>> {
    let quoted = format!("\"{path}\"");
    let start = source.find(&quoted)? + 1;
    let span = span.unwrap_or(0..path.len());
    let end = span.end.max(span.start + 1).min(path.len()).max(span.start);
    Some(start + span.start..start + end)
}

fn report(filename: &str, source: &str, title: &str, span: Range<usize>, message: &str) {
    let result = Report::build(ReportKind::Error, (filename, span.clone()))
        .with_message(title)
        .with_label(
            Label::new((filename, span))
                .with_message(message)
                .with_color(Color::Red),
        )
        .finish()
        .eprint((filename, Source::from(source)));
    if let Err(error) = result {
        eprintln!("Error: {message} ({error})");
    }
}

fn print_functions() -> anyhow::Result<()> {
    let rt = Runtime::default();
    let mut listing = serde_json::Map::new();
    for (key, desc) in rt.function_descs() {
        listing.insert(key, serde_json::to_value(desc)?);
    }
    println!("{}", serde_json::to_string_pretty(&Json::Object(listing))?);
    Ok(())
}
