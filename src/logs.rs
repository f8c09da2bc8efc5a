use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{FixedOffset, Utc};
use colored::Colorize;
use env_logger::Builder;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::github::GithubClient;

/// Directory name used when `LOG_FILE_DIR` is not set, resolved against the
/// current working directory.
const DEFAULT_LOG_DIR: &str = "logs";

/// File suffix used when `LOG_FILE_EXTENSION` is not set.
const DEFAULT_EXTENSION: &str = ".log";

/// Rotation threshold in megabytes when `LOG_MAX_FILE_SIZE_MB` is not set.
const DEFAULT_MAX_FILE_SIZE_MB: u64 = 300;

/// Retention window applied when `LOG_RETENTION_UNIT`/`LOG_RETENTION_VALUE`
/// are not set: seven days.
const DEFAULT_RETENTION_UNIT: &str = "days";
const DEFAULT_RETENTION_VALUE: u64 = 7;

/// Sweep odds applied when `LOG_GC_PROBABILITY`/`LOG_GC_DIVISOR` are not set:
/// a 5-in-100 chance per write.
const DEFAULT_GC_PROBABILITY: u32 = 5;
const DEFAULT_GC_DIVISOR: u32 = 100;

/// Message emitted when the log directory cannot be created, scanned, or
/// written. Kept as a single canned string so operators can grep for it.
pub const INIT_ERROR_MESSAGE: &str = "Unable to initialize the log subsystem! \
    Check that the process has write permissions for the log directory.";

/// Matches angle-bracket markup, including an unterminated trailing tag.
static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>?").expect("tag pattern compiles"));

/// Sink for the subsystem's own failure messages. A logger cannot log its own
/// breakage through itself, so degradations are pushed through this trait
/// instead of being raised to the caller.
pub trait Reporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Default sink: a red line on stderr.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, message: &str) {
        eprintln!("{}", message.red());
    }
}

/// Recognized levels for a log entry. Anything else renders nothing and the
/// write becomes a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Critical,
    Exception,
}

impl LogLevel {
    /// Parses a level tag after uppercasing it, so `info` and `INFO` name the
    /// same level. Returns `None` for anything outside the recognized set.
    pub fn parse(raw: &str) -> Option<LogLevel> {
        match raw.to_uppercase().as_str() {
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            "EXCEPTION" => Some(LogLevel::Exception),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Odds for the inline retention sweep: the sweep runs when a uniform draw
/// from `[1, divisor]` lands at or below `probability`.
#[derive(Debug, Clone)]
pub struct GcSettings {
    pub probability: u32,
    pub divisor: u32,
}

/// Remote archival target. Archival is on exactly when both fields are
/// non-empty; there is no separate switch.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub repository: String,
    pub branch: String,
}

impl ArchiveSettings {
    pub fn enabled(&self) -> bool {
        !self.repository.is_empty() && !self.branch.is_empty()
    }
}

/// Snapshot of the active logging configuration. Resolved fresh for every
/// operation, never cached, so environment changes and day boundaries are
/// picked up on the next call without any shared state.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub extension: String,
    pub today: String,
    pub timezone: FixedOffset,
    pub max_file_size: u64,
    pub file_index: u32,
    pub retention: Duration,
    pub gc: GcSettings,
    pub archive: ArchiveSettings,
}

impl LogConfig {
    /// File name of the active rotation slot, `{today}-{index}{extension}`.
    pub fn current_file_name(&self) -> String {
        format!("{}-{}{}", self.today, self.file_index, self.extension)
    }

    pub fn current_file_path(&self) -> PathBuf {
        self.directory.join(self.current_file_name())
    }

    /// Second-precision timestamp in the configured timezone.
    pub fn now_stamp(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

/// Parses a UTC offset written as `+HH:MM`, `-HH:MM`, or bare hours such as
/// `-3`. Returns `None` for anything else.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (sign, rest) = match raw.strip_prefix('-') {
        Some(rest) => (-1i32, rest),
        None => (1i32, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Reads `LOG_TIMEZONE_OFFSET` on every call. Unset or unparseable values
/// mean UTC.
pub fn timezone_offset() -> FixedOffset {
    env::var("LOG_TIMEZONE_OFFSET")
        .ok()
        .as_deref()
        .and_then(parse_utc_offset)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
}

/// Resolves the log directory from `LOG_FILE_DIR`, joining relative values
/// onto the current working directory. The directory is not created here; the
/// writer creates it lazily.
pub fn log_directory() -> PathBuf {
    let raw =
        PathBuf::from(env::var("LOG_FILE_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()));
    if raw.is_absolute() {
        raw
    } else {
        env::current_dir().map(|cwd| cwd.join(&raw)).unwrap_or(raw)
    }
}

/// Converts a retention `{unit, value}` pair into a duration. Unit spellings
/// are case-insensitive: `s`/`sec(s)`/`second(s)`, `m`/`min(s)`/`minute(s)`,
/// `h`/`hour(s)`, `d`/`day(s)`, and `mo`/`month(s)` counted as 30-day blocks.
/// An unrecognized unit converts to a zero duration, which makes every file
/// in the directory eligible for the next sweep.
pub fn retention_duration(unit: &str, value: u64) -> Duration {
    let seconds = match unit.to_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => value,
        "m" | "min" | "mins" | "minute" | "minutes" => value.saturating_mul(60),
        "h" | "hour" | "hours" => value.saturating_mul(60 * 60),
        "d" | "day" | "days" => value.saturating_mul(24 * 60 * 60),
        "mo" | "month" | "months" => value.saturating_mul(30 * 24 * 60 * 60),
        _ => 0,
    };
    Duration::from_secs(seconds)
}

/// Returns the size of a file in bytes, or 0 when it cannot be read. The
/// rotation scan leans on the zero so a stat failure never aborts a write.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Picks the 1-based index of the active rotation file for `today`.
///
/// This is a counting pass, not a first-fit search: the index starts at 1 and
/// is bumped once for every existing file whose name starts with `today`,
/// ends with `extension`, and whose size is at or over `max_file_size`. With
/// sparse or hand-renamed files the count can land on an index that already
/// exists; downstream tooling depends on the naming sequence this produces,
/// so the pass stays a plain count.
///
/// A missing directory means index 1. A listing failure is reported through
/// `reporter` and the count accumulated so far is kept.
pub fn next_file_index(
    directory: &Path,
    today: &str,
    extension: &str,
    max_file_size: u64,
    reporter: &dyn Reporter,
) -> u32 {
    let mut index = 1;
    if !directory.exists() {
        return index;
    }
    match std::fs::read_dir(directory) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(today)
                    && name.ends_with(extension)
                    && file_size(&entry.path()) >= max_file_size
                {
                    index += 1;
                }
            }
        }
        Err(e) => reporter.report(&format!("Failed to scan the log directory for rotation: {e}")),
    }
    index
}

/// Resolves the full logging configuration from the environment and the
/// current state of the log directory.
///
/// Variables read on every call: `LOG_FILE_DIR`, `LOG_FILE_EXTENSION`,
/// `LOG_TIMEZONE_OFFSET`, `LOG_MAX_FILE_SIZE_MB`, `LOG_RETENTION_UNIT`,
/// `LOG_RETENTION_VALUE`, `LOG_GC_PROBABILITY`, `LOG_GC_DIVISOR`,
/// `LOG_ARCHIVE_REPO`, `LOG_ARCHIVE_BRANCH`. Unparseable numbers fall back to
/// their defaults; a configured divisor of zero or less collapses to 100, and
/// oversized sizes and divisors clamp instead of overflowing.
pub fn resolve_config() -> LogConfig {
    resolve_config_with(&ConsoleReporter)
}

/// Same as [`resolve_config`], with an injected reporter for the directory
/// scan.
pub fn resolve_config_with(reporter: &dyn Reporter) -> LogConfig {
    let timezone = timezone_offset();
    let today = Utc::now().with_timezone(&timezone).format("%Y-%m-%d").to_string();
    let directory = log_directory();
    let extension =
        env::var("LOG_FILE_EXTENSION").unwrap_or_else(|_| DEFAULT_EXTENSION.to_string());
    let max_file_size = env::var("LOG_MAX_FILE_SIZE_MB")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB)
        .saturating_mul(1024 * 1024);
    let retention_unit =
        env::var("LOG_RETENTION_UNIT").unwrap_or_else(|_| DEFAULT_RETENTION_UNIT.to_string());
    let retention_value = env::var("LOG_RETENTION_VALUE")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_VALUE);
    let probability = env::var("LOG_GC_PROBABILITY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_GC_PROBABILITY);
    let divisor = env::var("LOG_GC_DIVISOR")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let divisor =
        if divisor <= 0 { DEFAULT_GC_DIVISOR } else { u32::try_from(divisor).unwrap_or(u32::MAX) };
    let archive = ArchiveSettings {
        repository: env::var("LOG_ARCHIVE_REPO").unwrap_or_default(),
        branch: env::var("LOG_ARCHIVE_BRANCH").unwrap_or_default(),
    };

    let file_index = next_file_index(&directory, &today, &extension, max_file_size, reporter);

    LogConfig {
        directory,
        extension,
        today,
        timezone,
        max_file_size,
        file_index,
        retention: retention_duration(&retention_unit, retention_value),
        gc: GcSettings { probability, divisor },
        archive,
    }
}

/// The probability gate for the inline sweep: draws a uniform integer from
/// `[1, divisor]` and runs the sweep when the draw lands at or below
/// `probability`. Takes the random source as a parameter so the gate can be
/// exercised with a seeded generator.
pub fn should_collect<R: Rng>(probability: u32, divisor: u32, rng: &mut R) -> bool {
    rng.gen_range(1..=divisor.max(1)) <= probability
}

/// Sweeps the log directory for expired files using a freshly resolved
/// configuration. See [`collect_expired`].
pub async fn garbage_collect(force: bool) -> bool {
    let reporter = ConsoleReporter;
    let config = resolve_config_with(&reporter);
    let archiver = build_archiver(&config, &reporter);
    collect_expired(&config, archiver.as_ref(), &reporter, force).await
}

/// Sweeps `config.directory` and deletes files whose age exceeds the
/// retention window.
///
/// Unless `force` is set, the probability gate decides whether the sweep runs
/// at all; a skipped sweep returns `false` without touching the filesystem.
/// Every regular file strictly older than the retention window (by
/// modification time) is deleted, after a successful upload through
/// `archiver` when one is supplied. A failed upload leaves the file in place
/// for a later pass rather than losing the data, and so does an enabled
/// archive configuration arriving without an archiver.
///
/// Listing, stat, and delete errors abort the pass with a report and a
/// `false` return; files already deleted stay deleted. A completed pass
/// returns `true` even when nothing was old enough to remove.
pub async fn collect_expired(
    config: &LogConfig,
    archiver: Option<&GithubClient>,
    reporter: &dyn Reporter,
    force: bool,
) -> bool {
    if !force {
        let mut rng = rand::thread_rng();
        if !should_collect(config.gc.probability, config.gc.divisor, &mut rng) {
            return false;
        }
    }

    let mut entries = match tokio::fs::read_dir(&config.directory).await {
        Ok(entries) => entries,
        Err(_) => {
            reporter.report(INIT_ERROR_MESSAGE);
            return false;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(_) => {
                reporter.report(INIT_ERROR_MESSAGE);
                return false;
            }
        };
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => {
                reporter.report(INIT_ERROR_MESSAGE);
                return false;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if now.duration_since(modified).unwrap_or_default() <= config.retention {
            continue;
        }

        let path = entry.path();
        if let Some(client) = archiver {
            let remote_name = entry.file_name().to_string_lossy().into_owned();
            let uploaded = client
                .upload_file(
                    &config.archive.repository,
                    &config.archive.branch,
                    &path,
                    &remote_name,
                    None,
                )
                .await;
            if !uploaded {
                continue;
            }
        } else if config.archive.enabled() {
            // Archival is wanted but no client is available; deleting now
            // would drop the only copy.
            continue;
        }
        if tokio::fs::remove_file(&path).await.is_err() {
            reporter.report(INIT_ERROR_MESSAGE);
            return false;
        }
        removed += 1;
    }

    if removed > 0 {
        log::debug!("Retention sweep removed {removed} expired file(s)");
    }
    true
}

/// Formats one entry as `"{timestamp} {LEVEL} > {message}\n"`, the exact line
/// the writer appends.
pub fn format_entry(stamp: &str, level: LogLevel, message: &str) -> String {
    format!("{stamp} {} > {message}\n", level.as_str())
}

/// Removes angle-bracket markup from free text. An unterminated trailing tag
/// such as `"broken <tag"` is removed as well.
pub fn strip_tags(text: &str) -> String {
    TAG_PATTERN.replace_all(text, "").into_owned()
}

/// Renders an error together with its `source()` chain, one cause per line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\nCaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Appends one entry to the active rotation file and returns the rendered
/// line, resolving the configuration from the environment. An empty return
/// means validation rejected the entry and nothing was written.
///
/// # Arguments
/// * `message` - The text to record; must be non-empty
/// * `level` - A level tag, matched case-insensitively against INFO, WARN,
///   ERROR, CRITICAL, and EXCEPTION
pub async fn write(message: &str, level: &str) -> String {
    let reporter = ConsoleReporter;
    let config = resolve_config_with(&reporter);
    let archiver = build_archiver(&config, &reporter);
    write_with(&config, archiver.as_ref(), &reporter, message, level).await
}

/// Core of [`write`] with the configuration, archiver, and reporter supplied
/// by the caller.
///
/// The steps run in a fixed order: make sure the log directory exists (a
/// failure is reported but the write is still attempted), run the retention
/// sweep through its probability gate, validate the level and message, append
/// the rendered line, and finally upload the active file under its base name
/// when an archiver is supplied. The upload result is dropped; persistence of
/// the archive copy is best effort from the writer's point of view. An append
/// failure is reported, yet the rendered line is still returned so the caller
/// can surface the text elsewhere.
pub async fn write_with(
    config: &LogConfig,
    archiver: Option<&GithubClient>,
    reporter: &dyn Reporter,
    message: &str,
    level: &str,
) -> String {
    if tokio::fs::create_dir_all(&config.directory).await.is_err() {
        reporter.report(INIT_ERROR_MESSAGE);
    }

    collect_expired(config, archiver, reporter, false).await;

    let Some(level) = LogLevel::parse(level) else {
        return String::new();
    };
    if message.is_empty() {
        return String::new();
    }

    let line = format_entry(&config.now_stamp(), level, message);
    let path = config.current_file_path();
    match append_line(&path, &line).await {
        Ok(()) => {
            if let Some(client) = archiver {
                let _ = client
                    .upload_file(
                        &config.archive.repository,
                        &config.archive.branch,
                        &path,
                        &config.current_file_name(),
                        None,
                    )
                    .await;
            }
        }
        Err(_) => reporter.report(INIT_ERROR_MESSAGE),
    }
    line
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    let mut fh = OpenOptions::new().create(true).append(true).open(path).await?;
    fh.write_all(line.as_bytes()).await?;
    fh.flush().await
}

/// Records an informational message, with markup stripped.
pub async fn info(message: &str) -> String {
    write(&strip_tags(message), "INFO").await
}

/// Records a warning, with markup stripped.
pub async fn warn(message: &str) -> String {
    write(&strip_tags(message), "WARN").await
}

/// Records an error message, with markup stripped.
pub async fn error(message: &str) -> String {
    write(&strip_tags(message), "ERROR").await
}

/// Records a critical message, with markup stripped.
pub async fn critical(message: &str) -> String {
    write(&strip_tags(message), "CRITICAL").await
}

/// Records an error and its cause chain. Unlike the free-text wrappers,
/// nothing is stripped from the rendered chain.
pub async fn exception(error: &dyn std::error::Error) -> String {
    let rendered = error_chain(error);
    write(&rendered, "EXCEPTION").await
}

fn build_archiver(config: &LogConfig, reporter: &dyn Reporter) -> Option<GithubClient> {
    if !config.archive.enabled() {
        return None;
    }
    match GithubClient::from_env() {
        Ok(client) => Some(client),
        Err(e) => {
            reporter.report(&format!("Remote archival is configured but unavailable: {e}"));
            None
        }
    }
}

/// Initializes env_logger for the process and installs a panic hook that
/// prints the panic location to stderr, which helps when a service only
/// ships file logs.
pub fn initialize_logs() {
    Builder::from_default_env().init();

    std::panic::set_hook(Box::new(|panic_info| {
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "The panic message is not a string.".to_string());
        match panic_info.location() {
            Some(location) => {
                eprintln!("PANIC at {}:{} => {message}", location.file(), location.line())
            }
            None => eprintln!("PANIC => {message}"),
        }
    }));
}
