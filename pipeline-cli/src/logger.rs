// Routes engine `log` records through the CLI output helpers

use crate::output;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct CliLogger;

impl Log for CliLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        match record.level() {
            Level::Error => output::error(&message),
            Level::Warn => output::warning(&message),
            Level::Info => output::info(&message),
            Level::Debug | Level::Trace => output::dim(&format!("  [{}] {}", record.target(), message)),
        }
    }

    fn flush(&self) {}
}

static LOGGER: CliLogger = CliLogger;

/// Install the logger: errors only, `--verbose` for info, twice for debug.
/// Run warnings are rendered from progress events.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
