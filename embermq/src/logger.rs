use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use slog::{o, Discard, Drain, Duplicate, Never};
use slog_term::{FullFormat, PlainDecorator};

use crate::conf::logging::Log;

pub use slog::Logger;

type BoxDrain = Box<dyn Drain<Ok = (), Err = Never> + Send>;

const ASYNC_CHAN_SIZE: usize = 16 * 1024;

/// Builds the broker logger from the `[log]` settings.
pub fn build_logger(cfg: &Log) -> Result<Logger> {
    if cfg.to.off() {
        return Ok(Logger::root(Discard, o!()));
    }

    let mut drain: Option<BoxDrain> = None;
    if cfg.to.file() {
        let path = cfg.path().ok_or_else(|| anyhow!("log.to is {} but log.file is empty", cfg.to))?;
        drain = Some(file_drain(&path)?);
    }
    if cfg.to.console() {
        let console: BoxDrain = Box::new(FullFormat::new(PlainDecorator::new(std::io::stdout())).build().fuse());
        drain = Some(match drain {
            Some(file) => Box::new(Duplicate::new(console, file).fuse()),
            None => console,
        });
    }
    let drain = drain.ok_or_else(|| anyhow!("log.to {} selects no output", cfg.to))?;

    let drain = slog::LevelFilter::new(drain, cfg.level).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(ASYNC_CHAN_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!("broker" => "embermq")))
}

fn file_drain(path: &Path) -> Result<BoxDrain> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {dir:?}"))?;
    }
    let file =
        OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("opening log file {path:?}"))?;
    Ok(Box::new(FullFormat::new(PlainDecorator::new(file)).build().fuse()))
}

/// Sends `log` facade records at `level` or above into `logger`.
///
/// The facade has one process-wide sink, so only the first broker of a process gets
/// it. Returns `false` when a sink was already installed.
pub fn install(logger: &Logger, level: slog::Level) -> bool {
    let filter = to_log_level(level).to_level_filter();
    let bridge = Bridge { logger: logger.clone(), level: filter };
    if log::set_boxed_logger(Box::new(bridge)).is_err() {
        return false;
    }
    log::set_max_level(filter);
    true
}

struct Bridge {
    logger: Logger,
    level: log::LevelFilter,
}

impl log::Log for Bridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, r: &log::Record) {
        if !self.enabled(r.metadata()) {
            return;
        }
        let location = slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let s = slog::RecordStatic { location: &location, level: to_slog_level(r.level()), tag: r.target() };
        self.logger.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use log::Log as _;
    use slog_term::PlainSyncDecorator;

    use super::*;
    use crate::conf::logging::To;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn file_logger_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Log {
            to: To::File,
            level: slog::Level::Debug,
            dir: dir.path().join("logs"),
            file: "broker.log".into(),
        };
        let logger = build_logger(&cfg).unwrap();
        slog::info!(logger, "hello {}", 1);
        drop(logger);
        assert!(dir.path().join("logs").join("broker.log").exists());
    }

    #[test]
    fn file_target_needs_a_name() {
        let cfg = Log { to: To::Both, file: String::new(), ..Default::default() };
        assert!(build_logger(&cfg).is_err());
    }

    #[test]
    fn bridge_forwards_facade_records() {
        let out = Captured::default();
        let drain = FullFormat::new(PlainSyncDecorator::new(out.clone())).build().fuse();
        let bridge = Bridge { logger: Logger::root(drain, o!()), level: log::LevelFilter::Info };

        assert!(!bridge.enabled(&log::Metadata::builder().level(log::Level::Debug).build()));
        bridge.log(
            &log::Record::builder()
                .level(log::Level::Debug)
                .target("embermq::topic")
                .args(format_args!("segment {} opened", 2))
                .build(),
        );
        bridge.log(
            &log::Record::builder()
                .level(log::Level::Warn)
                .target("embermq::topic")
                .args(format_args!("segment {} sealed", 3))
                .build(),
        );

        let text = out.text();
        assert!(text.contains("WARN"), "{text}");
        assert!(text.contains("segment 3 sealed"), "{text}");
        assert!(!text.contains("segment 2 opened"), "{text}");
    }

    #[test]
    fn only_one_facade_sink() {
        let logger = Logger::root(Discard, o!());
        install(&logger, slog::Level::Info);
        assert!(!install(&logger, slog::Level::Debug));
        assert!(log::max_level() >= log::LevelFilter::Error);
    }

    #[test]
    fn level_mapping() {
        assert_eq!(to_log_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(to_slog_level(log::Level::Warn), slog::Level::Warning);
    }
}
