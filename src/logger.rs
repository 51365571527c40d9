use anyhow::{Context, Result};
use log::{info, LevelFilter};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;

// Ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize logging to stderr, or to a timestamped file under `log_dir`.
///
/// `RUST_LOG` still applies on top of the level chosen by `verbose`. Returns the log file
/// path when one was created.
pub fn init_logger(log_dir: Option<&Path>, verbose: bool) -> Result<Option<PathBuf>> {
    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level);
    builder.parse_default_env();

    let log_path = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let log_path = dir.join(log_file_name(chrono::Local::now()));
            let log_file = File::create(&log_path)
                .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {} {}:{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            });
            builder.target(env_logger::Target::Pipe(Box::new(log_file)));
            Some(log_path)
        }
        None => {
            builder.target(env_logger::Target::Stderr);
            None
        }
    };

    INIT.call_once(|| {
        let _ = builder.try_init();
        info!("fbtap v{} logger initialized at level {:?}", fbtap_core::VERSION, log_level);
        log_system_info();
    });

    Ok(log_path)
}

fn log_file_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("fbtap_{}.log", now.format("%Y%m%d_%H%M%S"))
}

fn log_system_info() {
    #[cfg(target_os = "linux")]
    info!("Operating System: Linux");
    #[cfg(feature = "drm")]
    info!("Feature: DRM capture enabled");
    #[cfg(not(feature = "drm"))]
    info!("Feature: DRM capture disabled, FBDEV only");
}
