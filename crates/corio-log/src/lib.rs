//! # corio-log — rolling file logger
//!
//! Implements [`log::Log`] over stderr or an append-only log file. File
//! output rolls to a new segment once the current one passes 10 MiB:
//! `server.log`, `server.1.log`, `server.2.log`, …
//!
//! The level comes from the `CORIO_LOG` environment variable
//! (`off`/`error`/`warn`/`info`/`debug`/`trace`), defaulting to `info`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Metadata, Record};

/// Segment size limit before the sink rolls to a new file.
const SEGMENT_LIMIT: u64 = 10 * 1024 * 1024;

enum Sink {
    Stderr,
    File {
        base: PathBuf,
        file: File,
        written: u64,
        segment: u32,
    },
}

struct Logger {
    sink: Mutex<Sink>,
}

static LOGGER: Mutex<Option<&'static Logger>> = Mutex::new(None);

/// Install the logger writing to stderr.
pub fn init() {
    install(Sink::Stderr);
}

/// Install the logger appending to `path`, rolling at 10 MiB per segment.
pub fn init_file(path: impl Into<PathBuf>) -> std::io::Result<()> {
    let base = path.into();
    let file = OpenOptions::new().create(true).append(true).open(&base)?;
    let written = file.metadata().map(|m| m.len()).unwrap_or(0);
    install(Sink::File {
        base,
        file,
        written,
        segment: 0,
    });
    Ok(())
}

fn install(sink: Sink) {
    let mut slot = LOGGER.lock().unwrap();
    if slot.is_some() {
        return; // keep the first installation
    }
    let logger: &'static Logger = Box::leak(Box::new(Logger {
        sink: Mutex::new(sink),
    }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level_from_env());
        *slot = Some(logger);
    }
}

fn level_from_env() -> LevelFilter {
    match std::env::var("CORIO_LOG").as_deref() {
        Ok("off") => LevelFilter::Off,
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{:<5}] [{}] {} ({})\n",
            record.level(),
            timestamp(),
            record.args(),
            record.module_path().unwrap_or("?"),
        );
        let mut sink = self.sink.lock().unwrap();
        match &mut *sink {
            Sink::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Sink::File {
                base,
                file,
                written,
                segment,
            } => {
                let _ = file.write_all(line.as_bytes());
                *written += line.len() as u64;
                if *written > SEGMENT_LIMIT {
                    *segment += 1;
                    if let Some(next) = roll(base, *segment) {
                        *file = next;
                        *written = 0;
                    }
                }
            }
        }
    }

    fn flush(&self) {
        let mut sink = self.sink.lock().unwrap();
        if let Sink::File { file, .. } = &mut *sink {
            let _ = file.flush();
        }
    }
}

fn roll(base: &PathBuf, segment: u32) -> Option<File> {
    let stem = base.file_stem()?.to_string_lossy();
    let ext = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let next = base.with_file_name(format!("{}.{}{}", stem, segment, ext));
    OpenOptions::new().create(true).append(true).open(next).ok()
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    // Civil date from the day count (Gregorian, epoch 1970-01-01).
    let mut year = 1970i64;
    let mut day = days as i64;
    loop {
        let len = if leap(year) { 366 } else { 365 };
        if day < len {
            break;
        }
        day -= len;
        year += 1;
    }
    let months = [
        31,
        if leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0;
    while day >= months[month] {
        day -= months[month];
        month += 1;
    }
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        year,
        month + 1,
        day + 1,
        h,
        m,
        s,
        now.subsec_millis()
    )
}

fn leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        // e.g. 2026-08-01 12:34:56.789
        assert_eq!(ts.len(), 23);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn test_roll_names_segments() {
        let dir = std::env::temp_dir().join("corio-log-test");
        let _ = std::fs::create_dir_all(&dir);
        let base = dir.join("server.log");
        let rolled = roll(&base, 3);
        assert!(rolled.is_some());
        assert!(dir.join("server.3.log").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
