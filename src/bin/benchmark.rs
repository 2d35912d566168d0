use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use jql::{EmitMode, Engine, EngineOptions, Stats};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Projection throughput benchmark", long_about = None)]
#[command(after_help = "EXAMPLES:
    benchmark                             # 20k synthetic employees, default queries
    benchmark --records 200000 --runs 5   # Bigger document, more runs
    benchmark --file data/large.json --query '{ id }'")]
struct Args {
    /// Employees in the synthetic document
    #[arg(long, default_value_t = 20_000)]
    records: usize,

    /// Measured runs per case; the median is reported
    #[arg(long, default_value_t = 3)]
    runs: usize,

    /// Benchmark this file instead of a synthetic document
    #[arg(long)]
    file: Option<PathBuf>,

    /// Extra query to measure alongside the built-in ones
    #[arg(long)]
    query: Option<String>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

const FULL_QUERY: &str = "{ id, name, email, active, salary, address { street, city, zip }, tags, projects { name, budget, milestones } }";
const SKIP_HEAVY_QUERY: &str = "{ id }";

/// Nested employee records with enough unselected bulk to make skipping matter.
fn synthetic_document(records: usize) -> String {
    let mut out = String::with_capacity(records * 420);
    out.push('[');
    for i in 0..records {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(
            out,
            r#"{{"id":{i},"name":"Employee {i}","email":"employee{i}@example.com","active":{active},"salary":{salary}.5,"address":{{"street":"{n} Main St","city":"City {city}","zip":"{zip:05}"}},"tags":["team-{team}","level-{level}"],"projects":[{{"name":"Project {p}","budget":{budget},"milestones":[{{"title":"Kickoff","done":true}},{{"title":"Launch","done":false}}]}}],"notes":"Lorem ipsum dolor sit amet, consectetur adipiscing elit \"quoted\" text"}}"#,
            active = i % 3 != 0,
            salary = 40_000 + (i * 37) % 90_000,
            n = i % 999 + 1,
            city = i % 50,
            zip = i % 100_000,
            team = i % 12,
            level = i % 5,
            p = i % 200,
            budget = (i * 131) % 1_000_000,
        );
    }
    out.push(']');
    out
}

struct Case {
    label: String,
    query: String,
    options: EngineOptions,
}

fn median(mut samples: Vec<(Duration, Stats)>) -> Option<(Duration, Stats)> {
    samples.sort_by_key(|(d, _)| *d);
    let mid = samples.len() / 2;
    samples.into_iter().nth(mid)
}

fn measure(case: &Case, buffer: &[u8], runs: usize) -> Result<(Duration, Stats)> {
    let mut engine = Engine::from_query(&case.query, case.options.clone())
        .with_context(|| format!("compiling {}", case.query))?;
    // Warmup also fills the string cache.
    engine.run(buffer).with_context(|| format!("running {}", case.label))?;

    let mut samples = Vec::with_capacity(runs);
    for _ in 0..runs.max(1) {
        let start = Instant::now();
        let document = engine.run(buffer)?;
        samples.push((start.elapsed(), document.stats));
    }
    median(samples).context("no samples")
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "jql=debug" } else { "jql=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let buffer = match &args.file {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => synthetic_document(args.records).into_bytes(),
    };
    println!("Projection benchmark");
    println!("{}", "=".repeat(60));
    println!("Input size: {:.2} MB", buffer.len() as f64 / 1024.0 / 1024.0);
    println!();

    let cached = EngineOptions::default();
    let uncached = EngineOptions { string_cache_capacity: 0, ..EngineOptions::default() };
    let mut cases = vec![
        Case { label: "full selection".into(), query: FULL_QUERY.into(), options: cached.clone() },
        Case { label: "skip-heavy".into(), query: SKIP_HEAVY_QUERY.into(), options: cached.clone() },
        Case { label: "full selection, no cache".into(), query: FULL_QUERY.into(), options: uncached },
        Case {
            label: "skip-heavy, raw".into(),
            query: SKIP_HEAVY_QUERY.into(),
            options: EngineOptions { emit_mode: EmitMode::Raw, ..cached.clone() },
        },
    ];
    if let Some(query) = &args.query {
        cases.push(Case { label: format!("custom {}", query), query: query.clone(), options: cached });
    }

    println!("{:<28} {:>10} {:>12} {:>10} {:>9}", "case", "median", "throughput", "skip", "matches");
    for case in &cases {
        match measure(case, &buffer, args.runs) {
            Ok((elapsed, stats)) => {
                let mbps = stats_throughput(buffer.len(), elapsed);
                println!(
                    "{:<28} {:>8.2}ms {:>7.1} Mbps {:>9.1}% {:>9}",
                    case.label,
                    elapsed.as_secs_f64() * 1000.0,
                    mbps,
                    stats.skip_ratio * 100.0,
                    stats.matched_count
                );
            }
            Err(e) => println!("{:<28} failed: {:#}", case.label, e),
        }
    }
    Ok(())
}

fn stats_throughput(bytes: usize, elapsed: Duration) -> f64 {
    Stats::new(0, bytes as u64, 0, elapsed).throughput_mbps
}
