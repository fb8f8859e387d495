//! CLI for the p1meter reader and listener.
//!
//! `p1meter reader` turns a meter's serial stream into multicast envelopes,
//! `p1meter listener` aggregates them into rollup files and
//! `p1meter decode` checks telegrams captured to a file.

use std::error::Error;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use p1meter::aggregator::{self, Event, spawn_ticker};
use p1meter::error::TransportError;
use p1meter::telegram::NamedField;
use p1meter::{Config, Framer, Publisher, Reader, Subscriber};

/// p1meter: DSMR P1 smart meter reader, distributor and aggregator.
#[derive(Parser)]
#[command(name = "p1meter", version, about)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter such as "info" or "p1meter=debug"; overrides RUST_LOG.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Read telegrams from the meter and publish them.
    Reader {
        /// Serial device or file to read; "-" reads stdin.
        #[arg(long)]
        device: Option<String>,

        /// Multicast group to publish to.
        #[arg(long)]
        group: Option<Ipv4Addr>,

        /// UDP port to publish to.
        #[arg(long)]
        port: Option<u16>,

        /// Multicast TTL.
        #[arg(long)]
        ttl: Option<u32>,
    },

    /// Receive envelopes and write detail, interval, day and week files.
    Listener {
        /// Multicast group to join.
        #[arg(long)]
        group: Option<Ipv4Addr>,

        /// UDP port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Local interface address used to join the group.
        #[arg(long)]
        interface: Option<Ipv4Addr>,
    },

    /// Decode telegrams from a capture file and print them as JSON.
    Decode {
        /// Capture file; "-" reads stdin.
        file: PathBuf,

        /// Reject telegrams with unknown or malformed lines.
        #[arg(long)]
        strict: bool,

        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,

        /// List fields with their readable names instead of as a map.
        #[arg(long)]
        names: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let result = match load_config(cli.config.as_deref(), &cli.command) {
        Ok(config) => match cli.command {
            Commands::Reader { .. } => cmd_reader(&config).await,
            Commands::Listener { .. } => cmd_listener(&config).await,
            Commands::Decode {
                file,
                strict: _,
                pretty,
                names,
            } => cmd_decode(&config, &file, pretty, names),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration file, if any, and applies command-line overrides.
fn load_config(path: Option<&Path>, command: &Commands) -> Result<Config, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match command {
        Commands::Reader {
            device,
            group,
            port,
            ttl,
        } => {
            if let Some(device) = device {
                config.transport.device.clone_from(device);
            }
            apply_overrides(&mut config, *group, *port);
            if let Some(ttl) = ttl {
                config.multicast.ttl = *ttl;
            }
        }
        Commands::Listener {
            group,
            port,
            interface,
        } => {
            apply_overrides(&mut config, *group, *port);
            if let Some(interface) = interface {
                config.multicast.interface = *interface;
            }
        }
        Commands::Decode { strict, .. } => {
            if *strict {
                config.parser.ignore_unknown_fields = false;
            }
        }
    }

    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, group: Option<Ipv4Addr>, port: Option<u16>) {
    if let Some(group) = group {
        config.multicast.group = group;
    }
    if let Some(port) = port {
        config.multicast.port = port;
    }
}

/// Implements `p1meter reader`.
async fn cmd_reader(config: &Config) -> Result<(), Box<dyn Error>> {
    let device = config.transport.device.as_str();
    let source: Box<dyn AsyncRead + Unpin + Send> = if device == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(device)
            .await
            .map_err(|e| TransportError::Lost {
                name: device.to_string(),
                reason: e.to_string(),
            })?;
        Box::new(file)
    };

    let publisher = Publisher::bind(&config.multicast).await?;
    let mut reader = Reader::new(config, publisher);
    tracing::info!(device, "reading telegrams");

    let lost = tokio::select! {
        err = reader.run(source, device) => Some(err),
        _ = tokio::signal::ctrl_c() => None,
    };

    let stats = reader.stats();
    tracing::info!(
        telegrams = stats.telegrams,
        rejected = stats.rejected,
        published = stats.published,
        publish_failures = stats.publish_failures,
        discarded_bytes = reader.discarded_bytes(),
        "reader stopped"
    );

    match lost {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Implements `p1meter listener`.
async fn cmd_listener(config: &Config) -> Result<(), Box<dyn Error>> {
    let settings = &config.aggregator;
    let mut subscriber = Subscriber::bind(&config.multicast, settings.slow_frame).await?;
    let aggregator = aggregator::from_config(config, Utc::now())?;

    let (events, queue) = mpsc::channel(settings.queue_capacity);
    let worker = tokio::spawn(aggregator.run(queue));
    let ticker = spawn_ticker(events.clone(), settings.tick);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let lost = loop {
        tokio::select! {
            received = subscriber.next() => match received {
                Ok(envelope) => {
                    if events.send(Event::Envelope(envelope)).await.is_err() {
                        tracing::error!("aggregator stopped unexpectedly");
                        break None;
                    }
                }
                Err(e) => break Some(e),
            },
            _ = &mut shutdown => {
                tracing::info!("interrupted, flushing windows");
                break None;
            }
        }
    };

    ticker.abort();
    if events.send(Event::Shutdown).await.is_err() {
        tracing::warn!("aggregator already stopped");
    }
    drop(events);

    match tokio::time::timeout(settings.shutdown_grace, worker).await {
        Ok(Ok(stats)) => tracing::info!(
            envelopes = stats.envelopes,
            written = stats.snapshots_written,
            lost = stats.snapshots_lost,
            clock_skewed = stats.clock_skewed,
            "listener stopped"
        ),
        Ok(Err(e)) => tracing::error!(error = %e, "aggregator task failed"),
        Err(_) => tracing::warn!(
            grace = ?settings.shutdown_grace,
            "final flush did not finish in time"
        ),
    }

    let tracker = subscriber.tracker();
    tracing::info!(
        missed = tracker.missed(),
        duplicates = tracker.duplicates(),
        restarts = tracker.resets(),
        "sequence summary"
    );

    match lost {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Output of `p1meter decode --names`.
#[derive(Serialize)]
struct NamedTelegram<'a> {
    header: &'a str,
    fields: Vec<NamedField<'a>>,
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

/// Implements `p1meter decode <file>`.
fn cmd_decode(
    config: &Config,
    file: &Path,
    pretty: bool,
    names: bool,
) -> Result<(), Box<dyn Error>> {
    let bytes = if file.as_os_str() == "-" {
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut bytes)?;
        bytes
    } else {
        std::fs::read(file)?
    };

    let parser = config.telegram_parser();
    let mut framer = Framer::new(config.transport.max_frame);
    let frames = framer.push(&bytes, Utc::now());
    let total = frames.len();
    let mut rejected = 0usize;

    for (index, frame) in frames.iter().enumerate() {
        match parser.parse(&frame.bytes) {
            Ok(measurement) => {
                let json = if names {
                    let named = NamedTelegram {
                        header: measurement.header(),
                        fields: measurement.named(parser.table()),
                    };
                    to_json(&named, pretty)?
                } else {
                    to_json(&measurement, pretty)?
                };
                println!("{json}");
            }
            Err(e) => {
                rejected += 1;
                eprintln!("telegram {}: {e}", index + 1);
            }
        }
    }

    eprintln!("{total} telegrams, {rejected} rejected");
    if total == 0 {
        return Err(format!("no telegrams found in '{}'", file.display()).into());
    }
    if rejected > 0 {
        return Err(format!("{rejected} of {total} telegrams rejected").into());
    }
    Ok(())
}
