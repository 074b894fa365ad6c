//! gpujoin CLI: run a join described in YAML on the simulated device runtime.

use clap::{Parser, Subcommand, ValueEnum};
use gpujoin_core::config::JoinConfig;
use gpujoin_core::source::RowSource;
use gpujoin_device::{SimDeviceConfig, SimRuntime};
use gpujoin_exec::{ColumnarChunk, GpuJoin, SortKey};
use gpujoin_io::{CsvSource, CsvWriter, JsonlWriter};
use gpujoin_planner::{parse_yaml_join, ConfigOverrides, ParsedJoin, RelationSpec};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gpujoin")]
#[command(about = "GpuJoin: multi-depth GPU join executor over CSV relations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a join from a YAML file
    Run {
        /// Path to the join YAML file
        #[arg(short, long)]
        join: PathBuf,

        /// Write results here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Result encoding
        #[arg(long, value_enum, default_value_t = OutputFormat::Jsonl)]
        format: OutputFormat,

        /// Sort results by these result columns; suffix `:desc` to reverse
        #[arg(long, value_delimiter = ',')]
        order_by: Vec<String>,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Validate a join YAML file (syntax and plan check)
    Validate {
        /// Path to the join YAML file
        #[arg(short, long)]
        join: PathBuf,
    },

    /// Show planner estimates, optionally next to a full execution (EXPLAIN)
    Explain {
        /// Path to the join YAML file
        #[arg(short, long)]
        join: PathBuf,

        /// Run the join first and report what it observed
        #[arg(long)]
        analyze: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Jsonl,
    Csv,
}

#[derive(clap::Args, Debug, Default)]
struct DeviceArgs {
    /// Number of simulated devices
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Memory of each simulated device in bytes
    #[arg(long)]
    device_memory: Option<usize>,

    /// Largest single device allocation in bytes
    #[arg(long)]
    max_alloc: Option<usize>,

    /// Inner chunk size in bytes (overrides config)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Spill directory (overrides config)
    #[arg(long)]
    spill_dir: Option<String>,

    /// Maximum tasks in flight (overrides config)
    #[arg(long)]
    max_async_tasks: Option<usize>,

    /// CSV sources have no header row
    #[arg(long)]
    no_headers: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            join,
            output,
            format,
            order_by,
            device,
        } => {
            if let Err(e) = run_join(&join, output.as_deref(), format, &order_by, &device) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Validate { join } => {
            if let Err(e) = validate_join(&join) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Join is valid");
        }
        Commands::Explain {
            join,
            analyze,
            json,
            device,
        } => {
            if let Err(e) = explain_join(&join, analyze, json, &device) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn load(join_path: &Path) -> CliResult<ParsedJoin> {
    let yaml_content = fs::read_to_string(join_path)?;
    Ok(parse_yaml_join(&yaml_content)?)
}

/// Relative sources are resolved against the directory of the YAML file.
fn resolve_source(join_path: &Path, source: &str) -> PathBuf {
    let path = Path::new(source);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    join_path
        .parent()
        .map_or_else(|| path.to_path_buf(), |dir| dir.join(path))
}

fn open_relation(join_path: &Path, rel: &RelationSpec, headers: bool) -> CliResult<Box<dyn RowSource>> {
    let path = resolve_source(join_path, &rel.source);
    let source = CsvSource::open(&path, rel.schema.clone(), headers)
        .map_err(|e| format!("relation '{}' ({}): {}", rel.alias, path.display(), e))?;
    Ok(Box::new(source))
}

fn build_config(doc: &ConfigOverrides, args: &DeviceArgs) -> JoinConfig {
    let mut config = JoinConfig::from_env();
    apply_join_config(&mut config, doc);
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if let Some(dir) = &args.spill_dir {
        config.spill_dir = dir.clone();
    }
    if let Some(n) = args.max_async_tasks {
        config.max_async_tasks = n;
    }
    config
}

fn build_join(join_path: &Path, parsed: ParsedJoin, args: &DeviceArgs) -> CliResult<GpuJoin> {
    let config = build_config(&parsed.config, args);
    let mut sim = SimDeviceConfig::with_devices(args.devices);
    if let Some(mem) = args.device_memory {
        sim.memory_per_device = mem;
    }
    if let Some(max) = args.max_alloc {
        sim.max_alloc_size = max;
    }
    let runtime = Arc::new(SimRuntime::new(sim));

    let headers = !args.no_headers;
    let outer = open_relation(join_path, &parsed.outer, headers)?;
    let inners = parsed
        .inners
        .iter()
        .map(|rel| open_relation(join_path, rel, headers))
        .collect::<CliResult<Vec<_>>>()?;

    Ok(GpuJoin::new(parsed.plan, config, runtime, outer, inners)?)
}

/// Turn `name[:asc|:desc]` into sort keys over the result columns.
fn parse_order_by(specs: &[String], columns: &[String]) -> CliResult<Vec<SortKey>> {
    specs
        .iter()
        .map(|spec| {
            let (name, dir) = spec.split_once(':').unwrap_or((spec.as_str(), "asc"));
            let column = columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| format!("unknown result column '{}' in --order-by", name))?;
            match dir.to_ascii_lowercase().as_str() {
                "asc" => Ok(SortKey::asc(column)),
                "desc" => Ok(SortKey::desc(column)),
                other => Err(format!("unknown sort direction '{}'", other).into()),
            }
        })
        .collect()
}

enum Sink {
    Jsonl(JsonlWriter<Box<dyn Write>>),
    Csv(CsvWriter<Box<dyn Write>>),
}

impl Sink {
    fn open(output: Option<&Path>, format: OutputFormat, columns: &[String]) -> CliResult<Self> {
        let writer: Box<dyn Write> = match output {
            Some(path) => Box::new(fs::File::create(path)?),
            None => Box::new(std::io::stdout().lock()),
        };
        Ok(match format {
            OutputFormat::Jsonl => Sink::Jsonl(JsonlWriter::new(writer, columns.to_vec())),
            OutputFormat::Csv => Sink::Csv(CsvWriter::new(writer, columns)?),
        })
    }

    fn write_chunk(&mut self, chunk: &ColumnarChunk) -> CliResult<()> {
        match self {
            Sink::Jsonl(w) => w.write_rows(chunk.rows())?,
            Sink::Csv(w) => w.write_rows(chunk.rows())?,
        }
        Ok(())
    }

    fn write_rows(&mut self, rows: &[gpujoin_core::types::Row]) -> CliResult<()> {
        match self {
            Sink::Jsonl(w) => w.write_rows(rows)?,
            Sink::Csv(w) => w.write_rows(rows)?,
        }
        Ok(())
    }

    fn finish(self) -> CliResult<()> {
        let mut writer = match self {
            Sink::Jsonl(w) => w.finish()?,
            Sink::Csv(w) => w.finish()?,
        };
        writer.flush()?;
        Ok(())
    }
}

fn run_join(
    join_path: &Path,
    output: Option<&Path>,
    format: OutputFormat,
    order_by: &[String],
    args: &DeviceArgs,
) -> CliResult<()> {
    let parsed = load(join_path)?;
    let columns = parsed.plan.result_names();
    let keys = parse_order_by(order_by, &columns)?;
    let mut join = build_join(join_path, parsed, args)?;
    let mut sink = Sink::open(output, format, &columns)?;

    let mut sorted_input = Vec::new();
    let mut rows = 0usize;
    while let Some(chunk) = join.next_chunk()? {
        rows += chunk.nitems();
        if keys.is_empty() {
            sink.write_chunk(&chunk)?;
        } else {
            sorted_input.push(Arc::new(chunk));
        }
    }
    if !keys.is_empty() {
        let ordered = gpujoin_exec::sort_chunks(sorted_input, &keys)?;
        sink.write_rows(&ordered)?;
    }
    sink.finish()?;

    let counters = join.counters().clone();
    join.end();
    tracing::info!(query = %join.query_id(), rows, "join finished");

    if output.is_some() {
        println!("✓ Join executed successfully");
        println!("  Result rows: {}", rows);
        println!("  Tasks: {} ({} retried)", counters.tasks, counters.retries);
        println!("  Windows: {}", counters.windows);
    }
    Ok(())
}

fn validate_join(join_path: &Path) -> CliResult<()> {
    let parsed = load(join_path)?;
    let config = build_config(&parsed.config, &DeviceArgs::default());
    config.validate()?;
    parsed.plan.validate(&config)?;
    Ok(())
}

fn explain_join(join_path: &Path, analyze: bool, json: bool, args: &DeviceArgs) -> CliResult<()> {
    let parsed = load(join_path)?;
    let mut join = build_join(join_path, parsed, args)?;
    if analyze {
        while join.next_chunk()?.is_some() {}
    }
    let report = join.explain();
    join.end();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

fn apply_join_config(cfg: &mut JoinConfig, doc: &ConfigOverrides) {
    if let Some(size) = doc.chunk_size {
        cfg.chunk_size = size;
    }
    if let Some(limit) = doc.chunk_size_limit {
        cfg.chunk_size_limit = limit;
    }
    if let Some(margin) = doc.chunk_size_margin {
        cfg.chunk_size_margin = margin;
    }
    if let Some(rows) = doc.outer_chunk_rows {
        cfg.outer_chunk_rows = rows;
    }
    if let Some(n) = doc.max_async_tasks {
        cfg.max_async_tasks = n;
    }
    if let Some(dir) = &doc.spill_dir {
        cfg.spill_dir = dir.clone();
    }
}
