use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flowscope::observability::init_tracing;
use flowscope::writer::{OutputFormat, WriterFactory};
use flowscope::{Config, DecoderRegistry, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "flowscope", version, about = "Flowscope – TCP reassembly and audit records from pcap files")]
struct Cli {
    /// Packet capture to process (legacy pcap)
    pcap: PathBuf,

    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma separated decoders to run (default: all)
    #[arg(long)]
    include: Option<String>,

    /// Comma separated decoders to leave out
    #[arg(long)]
    exclude: Option<String>,

    /// Directory for record files
    #[arg(long)]
    out: Option<PathBuf>,

    /// Record file format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Skip decoders that fail to initialize instead of aborting
    #[arg(long, default_value_t = false)]
    ignore_decoder_init_errors: bool,

    /// Count records in prometheus counters and write metrics.prom
    #[arg(long, default_value_t = false)]
    export_metrics: bool,

    /// List registered decoders and exit
    #[arg(long, default_value_t = false)]
    list_decoders: bool,

    /// Use JSON logs
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
    Null,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Null => OutputFormat::Null,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "flowscope failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let registry = DecoderRegistry::with_builtin();
    if cli.list_decoders {
        for (name, kind, description) in registry.describe() {
            println!("{name:<8} {kind:?}\t{description}");
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let out_dir = config.output.out_dir.clone();
    let writers = WriterFactory::new(config.output.clone());
    let pipeline = Pipeline::new(config, &registry, writers, None)?;
    let summary = pipeline.run(&cli.pcap).await?;

    if let Some(metrics) = &summary.metrics {
        std::fs::create_dir_all(&out_dir)?;
        let path = out_dir.join("metrics.prom");
        std::fs::write(&path, metrics).with_context(|| format!("failed to write {}", path.display()))?;
    }

    println!(
        "Processed {} packets: connections={}, stream_bytes={}, idle_flushed={}, write_failures={}",
        summary.ingest.packets,
        summary.connections.flows,
        summary.connections.bytes,
        summary.ingest.idle_flushed,
        summary.write_failures()
    );
    for decoder in &summary.decoders {
        println!(
            "  {:<8} records={} written={} bytes={}",
            decoder.name, decoder.records, decoder.written, decoder.bytes
        );
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(include) = &cli.include {
        config.decoders.include = include.clone();
    }
    if let Some(exclude) = &cli.exclude {
        config.decoders.exclude = exclude.clone();
    }
    if let Some(out) = &cli.out {
        config.output.out_dir = out.clone();
    }
    if let Some(format) = cli.format {
        config.output.format = format.into();
    }
    config.decoders.ignore_init_errors |= cli.ignore_decoder_init_errors;
    config.export_metrics |= cli.export_metrics;
    Ok(config)
}
