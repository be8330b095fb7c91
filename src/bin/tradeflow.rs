use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tradeflow::pipeline::{PipelineConfig, TradePipeline};
use tradeflow::sink::{
    CountingAcknowledger, CsvTradeStore, JsonLinesUpdateSink, LogUpdateSink, NullTradeStore,
    TradeStore, UpdateSink,
};
use tradeflow::JsonTradeCodec;

#[derive(Parser)]
#[command(name = "tradeflow", version)]
#[command(about = "Run JSON trade lines through the persistence and aggregation pipeline")]
struct Cli {
    /// JSON-lines trade input, or '-' for stdin
    #[arg(long)]
    input: String,

    /// Pipeline config (JSON). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write persisted trades to this CSV file (default: discard)
    #[arg(long)]
    trades_csv: Option<PathBuf>,

    /// Write aggregation updates as JSON lines (default: log them)
    #[arg(long)]
    updates_jsonl: Option<PathBuf>,

    /// Primary ring capacity (power of two)
    #[arg(long)]
    ring_capacity: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(capacity) = cli.ring_capacity {
        config.ring_capacity = capacity;
    }

    let store: Box<dyn TradeStore> = match &cli.trades_csv {
        Some(path) => Box::new(
            CsvTradeStore::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(NullTradeStore),
    };
    let updates: Box<dyn UpdateSink> = match &cli.updates_jsonl {
        Some(path) => Box::new(
            JsonLinesUpdateSink::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(LogUpdateSink),
    };
    let acks = CountingAcknowledger::new();

    let input: Box<dyn BufRead> = if cli.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&cli.input).with_context(|| format!("opening {}", cli.input))?;
        Box::new(BufReader::new(file))
    };

    let mut pipeline = TradePipeline::start(
        config,
        JsonTradeCodec::new(),
        store,
        updates,
        acks.clone(),
    )
    .context("starting pipeline")?;
    let mut publisher = pipeline.publisher()?;

    for (line_no, line) in input.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        publisher
            .publish(line.as_bytes())
            .with_context(|| format!("publishing line {}", line_no + 1))?;
    }

    let report = pipeline.shutdown().context("shutting down pipeline")?;
    println!("published: {}", report.published);
    println!("acknowledged: {}", acks.count());
    for stage in &report.stages {
        println!(
            "{:<40} seq={:<8} processed={:<8} failed={}",
            stage.name, stage.sequence, stage.processed, stage.failed
        );
    }
    println!("ack latency: {}", report.ack_latency);
    Ok(())
}
