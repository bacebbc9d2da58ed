use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;

/// Console logger for the driver: `"[LEVEL] target: message"` on stderr.
///
/// Log targets are module paths (`knacs::stream`, `knacs::area`, ...), which
/// plays the role of the usual `pr_fmt` prefix.
pub struct KernelLogger {
    max_level: LevelFilter,
}

impl KernelLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger. Call once during init.
    ///
    /// # Errors
    /// If some logger is already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn format(record: &Record) -> String {
        format!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Best effort; a console write failure must not take the driver down.
        let _ = writeln!(std::io::stderr().lock(), "{}", Self::format(record));
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
