mod export;
mod logger;
mod settings;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use fbtap_core::{CaptureError, CaptureSession, ChangeResult};
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use settings::Settings;

/// Seconds between two statistics lines of the watch loop
const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn cli() -> Command<'static> {
    Command::new("fbtap")
        .version(fbtap_core::VERSION)
        .about("Capture the console framebuffer and report which rows change")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("Settings file. Default is fbtap/settings.json in the user config directory."),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .takes_value(true)
                .global(true)
                .help("Capture backend: auto, drm or fbdev"),
        )
        .arg(
            Arg::new("drm-device")
                .long("drm-device")
                .takes_value(true)
                .global(true)
                .help("DRM device node, e.g. /dev/dri/card0"),
        )
        .arg(
            Arg::new("fb-device")
                .long("fb-device")
                .takes_value(true)
                .global(true)
                .help("Framebuffer device node, e.g. /dev/fb0"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .takes_value(false)
                .global(true)
                .help("Sets the level of verbosity"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .takes_value(true)
                .global(true)
                .help("Directory to store log files. Default is stderr."),
        )
        .subcommand(Command::new("info").about("Print the active backend and screen format as JSON"))
        .subcommand(
            Command::new("watch")
                .about("Poll the screen and log changed regions")
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .takes_value(true)
                        .help("Delay between polls in milliseconds"),
                )
                .arg(
                    Arg::new("polls")
                        .long("polls")
                        .takes_value(true)
                        .help("Stop after this many polls. Default is to run until killed."),
                ),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Save the screen as PNG")
                .arg(
                    Arg::new("output")
                        .required(true)
                        .index(1)
                        .help("Output PNG file"),
                )
                .arg(
                    Arg::new("polls")
                        .long("polls")
                        .takes_value(true)
                        .default_value("1")
                        .help("Polls to run before saving"),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();

    if let Err(e) = run(&matches) {
        match e.downcast_ref::<CaptureError>() {
            Some(capture) => error!("Capture failed ({:?}): {:#}", capture.class(), e),
            None => error!("{:#}", e),
        }
        eprintln!("fbtap: {:#}", e);
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let settings = load_settings(matches)?;

    let log_dir = matches.value_of("log-dir").map(PathBuf::from).or_else(|| settings.log_dir.clone());
    if let Some(path) = logger::init_logger(log_dir.as_deref(), matches.is_present("verbose"))? {
        debug!("Logging to {}", path.display());
    }

    match matches.subcommand() {
        Some(("info", _)) => handle_info(&settings),
        Some(("watch", sub)) => handle_watch(&settings, sub),
        Some(("snapshot", sub)) => handle_snapshot(&settings, sub),
        _ => unreachable!("clap requires a subcommand"),
    }
}

/// Settings file merged with the command-line overrides
fn load_settings(matches: &ArgMatches) -> Result<Settings> {
    let mut settings = match matches.value_of("config") {
        Some(path) => Settings::load_from(Path::new(path))?,
        None => Settings::load()?,
    };

    if let Some(backend) = matches.value_of("backend") {
        settings.backend = backend.to_string();
    }
    if let Some(path) = matches.value_of("drm-device") {
        settings.drm_device = PathBuf::from(path);
    }
    if let Some(path) = matches.value_of("fb-device") {
        settings.fb_device = PathBuf::from(path);
    }
    // Validate early so a typo fails before any device is touched
    settings.preference()?;
    Ok(settings)
}

fn parse_count(matches: &ArgMatches, name: &str) -> Result<Option<u64>> {
    matches
        .value_of(name)
        .map(|v| v.parse::<u64>().with_context(|| format!("Invalid --{} value '{}'", name, v)))
        .transpose()
}

fn open_session(settings: &Settings) -> Result<CaptureSession> {
    let config = settings.capture_config()?;
    info!("Opening capture session (backend: {})", config.preference);
    Ok(CaptureSession::open(&config)?)
}

fn handle_info(settings: &Settings) -> Result<()> {
    let mut session = open_session(settings)?;
    let report = serde_json::json!({
        "version": fbtap_core::VERSION,
        "backend": session.kind(),
        "format": session.format(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    session.release();
    Ok(())
}

/// Running totals of the watch loop
#[derive(Debug, Default)]
struct WatchStats {
    polls: u64,
    changed: u64,
    rows: u64,
}

impl WatchStats {
    fn record(&mut self, result: &ChangeResult) {
        self.polls += 1;
        if let Some(rect) = result.rect() {
            self.changed += 1;
            self.rows += u64::from(rect.height());
        }
    }
}

fn handle_watch(settings: &Settings, matches: &ArgMatches) -> Result<()> {
    let interval = Duration::from_millis(parse_count(matches, "interval-ms")?.unwrap_or(settings.poll_interval_ms));
    let limit = parse_count(matches, "polls")?;

    let mut session = open_session(settings)?;
    info!("Watching every {:?}", interval);

    let mut stats = WatchStats::default();
    let mut last_report = Instant::now();
    while limit.map_or(true, |n| stats.polls < n) {
        let result = session.poll_and_diff()?;
        stats.record(&result);

        if let ChangeResult::Changed(rect) = result {
            info!(
                "Changed: x {}..={}, y {}..={} ({} rows)",
                rect.min_x,
                rect.max_x,
                rect.min_y,
                rect.max_y,
                rect.height()
            );
        }
        if last_report.elapsed() >= STATS_INTERVAL {
            info!("Stats: {} polls, {} changed, {} rows forwarded", stats.polls, stats.changed, stats.rows);
            last_report = Instant::now();
        }

        std::thread::sleep(interval);
    }

    info!("Stats: {} polls, {} changed, {} rows forwarded", stats.polls, stats.changed, stats.rows);
    session.release();
    Ok(())
}

fn handle_snapshot(settings: &Settings, matches: &ArgMatches) -> Result<()> {
    let output = PathBuf::from(matches.value_of("output").context("Missing output path")?);
    let polls = parse_count(matches, "polls")?.unwrap_or(1);

    let mut session = open_session(settings)?;
    for _ in 0..polls {
        session.poll_and_diff()?;
    }

    let format = *session.format();
    export::save_png(&output, session.snapshot(), &format)?;
    info!("Saved {}x{} snapshot to {}", format.width, format.height, output.display());
    session.release();
    Ok(())
}
