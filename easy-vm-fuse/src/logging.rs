//! Global logger

use log::{Level, LevelFilter, Log, Metadata, Record};

/// a simple logger
struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        println!(
            "\u{1B}[{}m[{:>5}][{:?}] {}\u{1B}[0m",
            color,
            record.level(),
            std::thread::current().id(),
            record.args(),
        );
    }
    fn flush(&self) {}
}

/// initiate logger, the level comes from the `LOG` environment variable
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    // 测试中多个用例都会调用 init，只有第一次会成功
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    log::set_max_level(match std::env::var("LOG").as_deref() {
        Ok("ERROR") => LevelFilter::Error,
        Ok("WARN") => LevelFilter::Warn,
        Ok("INFO") => LevelFilter::Info,
        Ok("DEBUG") => LevelFilter::Debug,
        Ok("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}
