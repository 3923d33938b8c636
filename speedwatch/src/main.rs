//! speedwatch: follow buses through a monitored area and report their speeds.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use speedwatch_core::config::{self, Config};
use speedwatch_core::{MonitoredArea, Tracker, TripPolicy};

mod archive;
mod dispatch;
mod feed;
mod lookup;
mod publish;
mod render;
mod stats;

use crate::archive::CsvArchiver;
use crate::dispatch::{forward_trips, DispatchReport, TripDispatcher, TRIP_QUEUE};
use crate::feed::{parse_capture_line, to_capture_line, FeedSubscriber};
use crate::lookup::{resolve_all, DigitransitLookup, DIGITRANSIT_URL, LOOKUP_TIMEOUT};
use crate::publish::{WebhookPublisher, PUBLISH_TIMEOUT};
use crate::render::SvgRenderer;

#[derive(Parser)]
#[command(name = "speedwatch", version, about = "Bus speed watch for a monitored area")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the live feed and report every trip through the area
    Run {
        #[command(flatten)]
        area: AreaArgs,

        #[command(flatten)]
        feed: FeedArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Drive the tracker from a capture file ("-" for stdin)
    Replay {
        file: PathBuf,

        #[command(flatten)]
        area: AreaArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Write live feed messages to a capture file for later replay
    Record {
        #[command(flatten)]
        feed: FeedArgs,

        /// Capture file to append to (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many messages
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Hourly speeding statistics from the CSV archives
    Stats {
        /// First operating day (default: last week's Monday)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last operating day (default: six days after --from)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Speed limit in km/h (default: from config)
        #[arg(long)]
        speed_limit: Option<f64>,

        /// Archive directory (default: from config)
        #[arg(long)]
        archive_dir: Option<PathBuf>,

        /// Number of bins in the max speed histogram
        #[arg(long, default_value_t = 20)]
        bins: usize,
    },

    /// Write area, routes and webhook to ~/.speedwatch/config.yaml
    Init {
        #[command(flatten)]
        area: AreaArgs,

        /// Route number to follow (repeatable)
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Webhook URL for publishing trips
        #[arg(long)]
        webhook: Option<String>,
    },
}

/// Monitored area. Each flag overrides the config file.
#[derive(Args, Debug, Default)]
struct AreaArgs {
    #[arg(long, allow_hyphen_values = true)]
    north: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    south: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    east: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    west: Option<f64>,
    /// Speed limit in km/h
    #[arg(long)]
    speed_limit: Option<f64>,
}

#[derive(Args, Debug)]
struct FeedArgs {
    /// Route number to follow (repeatable, default: from config)
    #[arg(long = "route")]
    routes: Vec<String>,

    /// MQTT broker host
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port (8883 uses TLS)
    #[arg(long)]
    port: Option<u16>,

    /// Digitransit subscription key
    #[arg(long, env = "DIGITRANSIT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Digitransit routing API endpoint
    #[arg(long, default_value = DIGITRANSIT_URL)]
    lookup_url: String,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Do not publish trips
    #[arg(long)]
    no_publish: bool,

    /// Do not append trips to the CSV archive
    #[arg(long)]
    no_archive: bool,

    /// Keep rendered images after publishing
    #[arg(long)]
    keep_renders: bool,

    /// Webhook URL for publishing trips
    #[arg(long, env = "SPEEDWATCH_WEBHOOK")]
    webhook: Option<String>,

    #[arg(long)]
    render_dir: Option<PathBuf>,

    #[arg(long)]
    archive_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry().with(stderr_layer).init();

    let cli = Cli::parse();
    let config = config::load_config();

    match cli.command {
        Commands::Run { area, feed, output } => cmd_run(&config, &area, &feed, &output).await,
        Commands::Replay { file, area, output } => cmd_replay(&config, file, &area, &output).await,
        Commands::Record {
            feed,
            output,
            limit,
        } => cmd_record(&config, &feed, output, limit).await,
        Commands::Stats {
            from,
            to,
            speed_limit,
            archive_dir,
            bins,
        } => cmd_stats(&config, from, to, speed_limit, archive_dir, bins),
        Commands::Init {
            area,
            routes,
            webhook,
        } => cmd_init(config, &area, routes, webhook),
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn merge_area(config: &Config, args: &AreaArgs) -> config::AreaConfig {
    let base = &config.area;
    config::AreaConfig {
        north: args.north.or(base.north),
        south: args.south.or(base.south),
        east: args.east.or(base.east),
        west: args.west.or(base.west),
        speed_limit: args.speed_limit.or(base.speed_limit),
    }
}

fn resolve_area(config: &Config, args: &AreaArgs) -> Result<MonitoredArea> {
    merge_area(config, args)
        .to_area()
        .context("monitored area is incomplete (set it with flags or `speedwatch init`)")
}

fn make_tracker(config: &Config, area: MonitoredArea) -> Result<Tracker> {
    config
        .tracker
        .validate()
        .context("invalid tracker settings in config")?;
    let policy = TripPolicy {
        min_samples: config.tracker.min_samples,
    };
    Ok(Tracker::new(area, policy, config.tracker.expire_after))
}

fn make_dispatcher(config: &Config, output: &OutputArgs) -> Result<TripDispatcher> {
    let render_dir = output
        .render_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.output.render_dir));
    let mut dispatcher = TripDispatcher::new(Box::new(SvgRenderer::new(render_dir)));

    if !output.no_publish {
        match output.webhook.as_ref().or(config.webhook.as_ref()) {
            Some(url) => {
                let publisher = WebhookPublisher::new(url, PUBLISH_TIMEOUT)?;
                dispatcher = dispatcher.with_publisher(Box::new(publisher), output.keep_renders);
            }
            None => warn!("no webhook configured, trips will not be published"),
        }
    }

    if !output.no_archive {
        let archive_dir = output
            .archive_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.output.archive_dir));
        dispatcher = dispatcher.with_archiver(Box::new(CsvArchiver::new(archive_dir)));
    }

    Ok(dispatcher)
}

async fn subscribe(config: &Config, feed: &FeedArgs) -> Result<FeedSubscriber> {
    let routes = if feed.routes.is_empty() {
        config.routes.clone()
    } else {
        feed.routes.clone()
    };
    let lookup = DigitransitLookup::new(&feed.lookup_url, feed.api_key.clone(), LOOKUP_TIMEOUT)?;
    let topics = resolve_all(&lookup, &routes)
        .await
        .context("route lookup failed")?;

    let host = feed.host.as_deref().unwrap_or(&config.feed.host);
    let port = feed.port.unwrap_or(config.feed.port);
    Ok(FeedSubscriber::connect(host, port, topics))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: &Config, area: &AreaArgs, feed: &FeedArgs, output: &OutputArgs) -> Result<()> {
    let area = resolve_area(config, area)?;
    let mut tracker = make_tracker(config, area)?;
    let mut subscriber = subscribe(config, feed).await?;
    let (tx, dispatcher) = dispatch::spawn(make_dispatcher(config, output)?, TRIP_QUEUE, false);

    info!(
        north = area.north,
        south = area.south,
        east = area.east,
        west = area.west,
        speed_limit = area.speed_limit,
        "watching area"
    );

    let result = loop {
        tokio::select! {
            msg = subscriber.next_message() => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => break Err(e),
                };
                let events = tracker.handle_message(&msg.topic, &msg.payload);
                forward_trips(events, &tx).await;
                if tracker.total_messages % 1000 == 0 {
                    tracker.log_summary();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
        }
    };

    subscriber.disconnect().await;
    drop(tx);
    let summary = dispatcher.await.context("trip dispatcher panicked")?;
    tracker.log_summary();
    info!(
        trips = summary.trips,
        published = summary.published,
        archived = summary.archived,
        "stopped"
    );
    result
}

async fn cmd_replay(config: &Config, file: PathBuf, area: &AreaArgs, output: &OutputArgs) -> Result<()> {
    let area = resolve_area(config, area)?;
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?;
        Box::new(io::BufReader::new(f))
    };

    let mut tracker = make_tracker(config, area)?;
    let (tx, dispatcher) = dispatch::spawn(make_dispatcher(config, output)?, TRIP_QUEUE, true);

    let mut bad_lines = 0u64;
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", file.display()))?;
        let msg = match parse_capture_line(&line) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                bad_lines += 1;
                warn!(line = n + 1, error = %e, "skipping capture line");
                continue;
            }
        };
        let events = tracker.handle_message(&msg.topic, &msg.payload);
        forward_trips(events, &tx).await;
    }

    drop(tx);
    let summary = dispatcher.await.context("trip dispatcher panicked")?;

    print_trips(&summary.reports);
    println!();
    print_tracker_summary(&tracker, bad_lines);
    Ok(())
}

async fn cmd_record(config: &Config, feed: &FeedArgs, output: Option<PathBuf>, limit: Option<u64>) -> Result<()> {
    let mut subscriber = subscribe(config, feed).await?;

    let sink: Box<dyn Write> = match &output {
        Some(path) => {
            let f = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(f)
        }
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BufWriter::new(sink);

    let mut recorded = 0u64;
    let result = loop {
        if limit.is_some_and(|l| recorded >= l) {
            break Ok(());
        }
        tokio::select! {
            msg = subscriber.next_message() => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => break Err(e),
                };
                writeln!(writer, "{}", to_capture_line(&msg)?)?;
                recorded += 1;
                if recorded % 100 == 0 {
                    writer.flush()?;
                    info!(recorded, "recording");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
        }
    };

    writer.flush()?;
    subscriber.disconnect().await;
    info!(recorded, "recording finished");
    result
}

fn cmd_stats(
    config: &Config,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    speed_limit: Option<f64>,
    archive_dir: Option<PathBuf>,
    bins: usize,
) -> Result<()> {
    let speed_limit = speed_limit
        .or(config.area.speed_limit)
        .context("speed limit is not set (use --speed-limit or `speedwatch init`)")?;
    let archive_dir = archive_dir.unwrap_or_else(|| PathBuf::from(&config.output.archive_dir));

    let (default_from, _) = stats::default_range(chrono::Local::now().date_naive());
    let from = from.unwrap_or(default_from);
    let to = to.unwrap_or(from + chrono::Duration::days(6));
    info!(%from, %to, dir = %archive_dir.display(), "producing statistics");

    let rows = stats::load_rows(&archive_dir, from, to)?;
    let trips = stats::trip_maxima(&rows);
    let hours = stats::hourly_counts(&trips, speed_limit);
    let speeding = trips.iter().filter(|t| t.is_speeding(speed_limit)).count();

    println!("Trips {from} .. {to}: {} ({} speeding, limit {speed_limit} km/h)", trips.len(), speeding);
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Hour (UTC)", "Speeding", "Compliant", "Speeding %"]);
    for (hour, count) in hours.iter().enumerate().filter(|(_, c)| c.total() > 0) {
        let share = 100.0 * count.speeding as f64 / count.total() as f64;
        table.add_row(vec![
            Cell::new(format!("{hour:02}:00")),
            Cell::new(count.speeding),
            Cell::new(count.compliant),
            Cell::new(format!("{share:.0}")),
        ]);
    }
    println!("{table}");

    let histogram = stats::speed_histogram(&trips, bins);
    if !histogram.is_empty() {
        println!();
        let mut table = Table::new();
        table.set_header(vec!["Max speed (km/h)", "Trips"]);
        for (start, end, count) in histogram {
            table.add_row(vec![Cell::new(format!("{start:.1} - {end:.1}")), Cell::new(count)]);
        }
        println!("{table}");
    }

    Ok(())
}

fn cmd_init(mut config: Config, area: &AreaArgs, routes: Vec<String>, webhook: Option<String>) -> Result<()> {
    config.area = merge_area(&config, area);
    if !routes.is_empty() {
        config.routes = routes;
    }
    if webhook.is_some() {
        config.webhook = webhook;
    }
    if let Err(e) = config.area.to_area() {
        warn!(error = %e, "area is not complete yet");
    }

    let path = config::save_config(&config)?;
    println!("Wrote {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_trips(reports: &[DispatchReport]) {
    if reports.is_empty() {
        println!("No trips finished.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Route", "Name", "Departure", "Samples", "Max km/h", "Limit", "Published", "Archived",
    ]);
    for report in reports {
        let trip = &report.trip;
        table.add_row(vec![
            Cell::new(&trip.key.route_number),
            Cell::new(&trip.key.route_name),
            Cell::new(format!("{} {}", trip.key.operating_day, trip.key.start_time)),
            Cell::new(trip.samples.len()),
            Cell::new(
                trip.max_speed_kmh()
                    .map(|s| format!("{s:.1}"))
                    .unwrap_or_else(|| "-".into()),
            ),
            Cell::new(format!("{:.0}", trip.area.speed_limit)),
            Cell::new(if report.published { "yes" } else { "no" }),
            Cell::new(if report.archived { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");
}

fn print_tracker_summary(tracker: &Tracker, bad_lines: u64) {
    let mut table = Table::new();
    table.set_header(vec!["Counter", "Value"]);
    let rows: [(&str, u64); 8] = [
        ("capture lines skipped", bad_lines),
        ("messages", tracker.total_messages),
        ("malformed", tracker.malformed_messages),
        ("missing coordinates", tracker.missing_coordinates),
        ("trips finalized", tracker.trips_finalized),
        ("trips discarded", tracker.trips_discarded),
        ("runs expired", tracker.runs_expired),
        ("still in area", tracker.tracked_count() as u64),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    println!("{table}");
}
