use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use jql::config::Settings;
use jql::{ndjson_parallel, ndjson_stream, EmitMode, Engine, RawMatch, Stats, WorkerPool};

#[derive(Parser)]
#[command(name = "jql", author, version, about = "Project JSON documents with a field selection query", long_about = None)]
#[command(after_help = "ENVIRONMENT VARIABLES:
    JQL_WORKERS         Worker threads for --ndjson [default: available cores]
    JQL_QUEUE_CAPACITY  Lines allowed to wait for a worker [default: 1024]
    JQL_CACHE_CAPACITY  Interned short strings per engine [default: 500]
    JQL_CHUNK_SIZE      Read size in bytes [default: 65536]
    RUST_LOG            Log filter, e.g. jql=debug

EXAMPLES:
    jql data.json '{ id, name }'              # Pretty-print the projection
    cat data.json | jql '{ user { email } }'  # Read stdin
    jql --ndjson --workers 4 events.ndjson '{ type, payload { id } }'
    jql --raw data.json '{ id }'              # Print matched source bytes")]
struct Args {
    /// [FILE] QUERY; reads stdin when FILE is omitted
    #[arg(value_name = "ARGS", num_args = 1..=2, required = true)]
    params: Vec<String>,

    /// Treat the input as newline-delimited JSON
    #[arg(long)]
    ndjson: bool,

    /// Print the source bytes of each matched field instead of a projection
    #[arg(long)]
    raw: bool,

    /// Print statistics to stderr when done
    #[arg(long)]
    stats: bool,

    /// Worker threads for --ndjson; 1 processes lines inline
    #[arg(short, long)]
    workers: Option<usize>,

    /// Read size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Single-line output
    #[arg(long)]
    compact: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn file_and_query(&self) -> (Option<PathBuf>, &str) {
        match self.params.as_slice() {
            [file, query] => (Some(PathBuf::from(file)), query.as_str()),
            [query] => (None, query.as_str()),
            _ => (None, ""),
        }
    }

    fn emit_mode(&self) -> EmitMode {
        if self.raw {
            EmitMode::Raw
        } else {
            EmitMode::Materialize
        }
    }
}

struct Output {
    out: io::BufWriter<io::StdoutLock<'static>>,
    compact: bool,
}

impl Output {
    fn new(compact: bool) -> Self {
        Self { out: io::BufWriter::new(io::stdout().lock()), compact }
    }

    fn value(&mut self, value: &Value) -> io::Result<()> {
        if self.compact {
            serde_json::to_writer(&mut self.out, value)?;
        } else {
            serde_json::to_writer_pretty(&mut self.out, value)?;
        }
        writeln!(self.out)
    }

    fn raw(&mut self, raw: &RawMatch) -> io::Result<()> {
        write!(self.out, "{}: ", raw.key)?;
        self.out.write_all(&raw.bytes)?;
        writeln!(self.out)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

async fn open_input(file: Option<&PathBuf>) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    Ok(match file {
        Some(path) => {
            let file = tokio::fs::File::open(path).await.with_context(|| format!("opening {}", path.display()))?;
            Box::new(file)
        }
        None => Box::new(tokio::io::stdin()),
    })
}

async fn run_document(args: &Args, settings: &Settings, out: &mut Output) -> Result<Stats> {
    let (file, query) = args.file_and_query();
    let mut engine = Engine::from_query(query, settings.engine_options(args.emit_mode()))?;

    let mut buffer = Vec::new();
    open_input(file.as_ref()).await?.read_to_end(&mut buffer).await.context("reading input")?;
    let buffer = bytes::Bytes::from(buffer);

    let document = engine.run_bytes(&buffer)?;
    let stats = document.stats;
    if args.raw {
        for raw in document.raw_matches() {
            out.raw(raw)?;
        }
    } else if let Some(value) = document.into_value() {
        out.value(&value)?;
    }
    Ok(stats)
}

/// Returns the number of lines that failed.
async fn run_ndjson(args: &Args, settings: &Settings, out: &mut Output) -> Result<u64> {
    let (file, query) = args.file_and_query();
    let reader = open_input(file.as_ref()).await?;
    let mut failed = 0u64;

    if settings.workers > 1 {
        // Compile once here so a bad query fails before any worker sees it.
        jql::compile(query)?;
        let pool = Arc::new(WorkerPool::new(settings.pool_config()).context("starting worker pool")?);
        debug!(target: "jql::cli", workers = pool.size(), "parallel ndjson");
        let mut responses = Box::pin(ndjson_parallel(reader, query, Arc::clone(&pool), args.emit_mode(), settings.chunk_size));
        while let Some(response) = responses.next().await {
            let response = response?;
            if let Some(error) = &response.error {
                warn!(target: "jql::cli", line = response.id, %error, "record failed");
                failed += 1;
                continue;
            }
            for raw in &response.raw {
                out.raw(raw)?;
            }
            if let Some(value) = &response.result {
                out.value(value)?;
            }
        }
        pool.terminate();
        return Ok(failed);
    }

    let mut records = Box::pin(ndjson_stream(reader, query, settings.engine_options(args.emit_mode()), settings.chunk_size)?);
    while let Some(record) = records.next().await {
        let record = record?;
        match record.outcome {
            Ok(document) => {
                for raw in document.raw_matches() {
                    out.raw(raw)?;
                }
                if let Some(value) = document.into_value() {
                    out.value(&value)?;
                }
            }
            Err(error) => {
                warn!(target: "jql::cli", line = record.line, %error, "record failed");
                failed += 1;
            }
        }
    }
    Ok(failed)
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::from_env();
    if let Some(workers) = args.workers {
        settings.workers = workers.max(1);
    }
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size.max(1);
    }
    debug!(target: "jql::cli", ?settings, "settings resolved");

    // NDJSON output is one record per line.
    let mut out = Output::new(args.compact || args.ndjson);
    let started = std::time::Instant::now();
    if args.ndjson {
        let failed = run_ndjson(&args, &settings, &mut out).await?;
        out.flush()?;
        if args.stats {
            eprintln!("elapsed: {:.2}ms, failed records: {}", started.elapsed().as_secs_f64() * 1000.0, failed);
        }
        if failed > 0 {
            bail!("{} record(s) failed", failed);
        }
        return Ok(());
    }

    let stats = run_document(&args, &settings, &mut out).await?;
    out.flush()?;
    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

fn is_broken_pipe(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<io::Error>().map_or(false, |e| e.kind() == io::ErrorKind::BrokenPipe))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let default_filter = if args.verbose { "jql=debug" } else { "jql=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(args).await {
        if is_broken_pipe(&e) {
            return;
        }
        eprintln!("jql: {:#}", e);
        std::process::exit(1);
    }
}
