//! courier - CLI tool for the envelope delivery pipeline
//!
//! This tool provides commands for:
//! - Checking configuration, endpoint and offline buffer status
//! - Sending envelope files through the pipeline
//! - Flushing the offline buffer
//! - Listing buffered envelopes
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/courier/config.toml (~/.config/courier/config.toml)
//! - Buffer: $XDG_DATA_HOME/courier/envelopes (~/.local/share/courier/envelopes)
//! - Logs: $XDG_STATE_HOME/courier/courier.log

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier_core::{
    ClientReportRecorder, Config, DiskBuffer, Dsn, Envelope, EnvelopeBuffer, Hint, Pipeline,
    SendOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Deliver and inspect telemetry envelopes")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/courier/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// DSN, overrides the config file
    #[arg(long, global = true)]
    dsn: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, endpoint and offline buffer status
    Status,

    /// Send envelope files and wait for delivery
    Send {
        /// Envelope files in wire format
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run one offline buffer flush cycle
    Flush,

    /// List envelopes in the offline buffer
    Buffer {
        /// One JSON object per envelope
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(dsn) = args.dsn {
        config.dsn = Some(dsn);
    }

    let _log_guard = if args.verbose {
        Some(courier_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(config, args.config.unwrap_or_else(Config::config_path)),
        Command::Send { files } => cmd_send(config, &files),
        Command::Flush => cmd_flush(config),
        Command::Buffer { json } => cmd_buffer(config, json),
    }
}

/// Parse the DSN and fold its options into the configuration
fn resolve(mut config: Config) -> Result<(Config, Option<Dsn>)> {
    let dsn = match &config.dsn {
        Some(raw) => Some(raw.parse::<Dsn>().context("invalid DSN")?),
        None => None,
    };
    if let Some(dsn) = &dsn {
        config.apply_dsn_options(dsn);
    }
    config.validate().context("invalid configuration")?;
    Ok((config, dsn))
}

fn open_disk_buffer(config: &Config) -> Result<Option<DiskBuffer>> {
    let dir = config.buffer.resolved_dir();
    if !config.buffer.enabled || !dir.exists() {
        return Ok(None);
    }
    let buffer = DiskBuffer::open(
        &dir,
        config.buffer.max_events,
        Arc::new(ClientReportRecorder::new()),
    )
    .with_context(|| format!("failed to open offline buffer at {}", dir.display()))?;
    Ok(Some(buffer))
}

fn cmd_status(config: Config, config_path: PathBuf) -> Result<()> {
    let (config, dsn) = resolve(config)?;

    println!("Courier Configuration");
    println!("=====================");
    println!();
    println!("Config File:     {}", config_path.display());

    match &dsn {
        Some(dsn) => {
            println!("DSN:             {}", dsn);
            println!("Endpoint:        {}", dsn.envelope_url());
        }
        None => println!("DSN:             <not set>"),
    }

    let transport = &config.transport;
    println!("Max Queue Size:  {}", transport.max_queue_size);
    println!(
        "Timeouts:        connect {}ms, read {}ms",
        transport.connect_timeout_ms, transport.read_timeout_ms
    );
    println!("Flush Timeout:   {}ms", transport.flush_timeout_ms);
    println!("Shutdown Grace:  {}ms", transport.shutdown_timeout_ms);
    println!("Client:          {}", transport.client_id());
    println!(
        "Log File:        {} (level {})",
        courier_core::logging::log_file_path().display(),
        config.logging.level
    );

    println!();
    println!("Buffer Enabled:  {}", config.buffer.enabled);
    println!("Buffer Dir:      {}", config.buffer.resolved_dir().display());
    println!("Max Events:      {}", config.buffer.max_events);
    println!("Flush Interval:  {}s", config.buffer.flush_interval_secs);
    let stored = open_disk_buffer(&config)?.map(|b| b.len()).unwrap_or(0);
    println!("Stored:          {}", stored);

    println!();
    if dsn.is_some() {
        println!("Status: Ready to send");
    } else {
        println!("Status: Not ready (set `dsn` in config.toml or pass --dsn)");
    }

    Ok(())
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Envelope::from_bytes(&bytes).with_context(|| format!("invalid envelope in {}", path.display()))
}

fn cmd_send(config: Config, files: &[PathBuf]) -> Result<()> {
    let flush_timeout = config.transport.flush_timeout();
    let pipeline = Pipeline::try_new(config).context("failed to start pipeline")?;
    tracing::info!(files = files.len(), "Sending envelope files");

    let mut outcomes = Vec::new();
    let mut rejected = 0usize;
    for path in files {
        let envelope = match read_envelope(path) {
            Ok(envelope) => envelope,
            Err(e) => {
                eprintln!("Skipping {}: {:#}", path.display(), e);
                rejected += 1;
                continue;
            }
        };

        let event_id = envelope.event_id();
        let (hint, outcome) = Hint::new().with_notifier();
        if pipeline.capture(envelope, hint) {
            outcomes.push((event_id, outcome));
        } else {
            rejected += 1;
        }
    }

    let drained = pipeline.flush(flush_timeout);

    let mut delivered = 0usize;
    let mut failed = 0usize;
    for (event_id, mut outcome) in outcomes {
        match outcome.try_recv() {
            Ok(SendOutcome::Success) => delivered += 1,
            Ok(outcome) => {
                failed += 1;
                println!("{}: {:?}", event_id.simple(), outcome);
            }
            Err(_) => {
                failed += 1;
                println!("{}: pending", event_id.simple());
            }
        }
    }
    pipeline.close();

    println!("Delivered: {}", delivered);
    println!("Failed:    {}", failed);
    println!("Rejected:  {}", rejected);
    if !drained {
        println!("Warning: flush timed out after {}ms", flush_timeout.as_millis());
    }

    if delivered == 0 {
        bail!("no envelope was delivered");
    }
    Ok(())
}

fn cmd_flush(config: Config) -> Result<()> {
    if !config.buffer.enabled {
        println!("Offline buffer is disabled.");
        return Ok(());
    }

    let pipeline = Pipeline::try_new(config).context("failed to start pipeline")?;
    let (Some(handle), Some(buffer)) = (pipeline.handle(), pipeline.buffer()) else {
        bail!("pipeline is disabled");
    };
    if !buffer.is_durable() {
        pipeline.close();
        bail!("offline buffer directory is not usable");
    }
    if buffer.is_empty() {
        println!("No buffered envelopes to flush.");
        pipeline.close();
        return Ok(());
    }

    println!("Flushing {} buffered envelope(s)...", buffer.len());
    let summary = handle.block_on(pipeline.drain_buffer());
    let remaining = buffer.len();
    pipeline.close();

    println!("Sent:      {}", summary.sent);
    println!("Dropped:   {}", summary.dropped);
    println!("Remaining: {}", remaining);
    Ok(())
}

fn cmd_buffer(config: Config, json: bool) -> Result<()> {
    let (config, _) = resolve(config)?;
    let Some(buffer) = open_disk_buffer(&config)? else {
        if !json {
            println!("No buffered envelopes.");
        }
        return Ok(());
    };

    let envelopes: Vec<Envelope> = buffer.iter().collect();
    if json {
        for envelope in &envelopes {
            let categories: Vec<&str> = envelope
                .category_counts()
                .keys()
                .map(|c| c.as_str())
                .collect();
            let line = serde_json::json!({
                "event_id": envelope.event_id().simple().to_string(),
                "items": envelope.items().len(),
                "categories": categories,
            });
            println!("{}", line);
        }
        return Ok(());
    }

    if envelopes.is_empty() {
        println!("No buffered envelopes.");
        return Ok(());
    }

    println!("Buffered Envelopes ({})", buffer.dir().display());
    println!();
    println!("{:<34} {:>6}  {}", "Event ID", "Items", "Categories");
    println!("{:-<60}", "");
    for envelope in &envelopes {
        let categories = envelope
            .category_counts()
            .iter()
            .map(|(category, count)| format!("{}={}", category, count))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<34} {:>6}  {}",
            envelope.event_id().simple(),
            envelope.items().len(),
            categories
        );
    }

    Ok(())
}
