//! Log bridge to the façade
//!
//! The crate logs through the `log` facade. When no other logger has been
//! installed, records are forwarded to `Facade::on_log` of every running
//! engine. A host that installs its own logger (env_logger, syslog, ...)
//! keeps it; the bridge then stays inactive.

use std::sync::{Arc, Once, RwLock};

use crate::facade::Facade;

static INIT_LOGGING: Once = Once::new();

static SINKS: RwLock<Vec<(u64, Arc<dyn Facade>)>> = RwLock::new(Vec::new());

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        // Fails harmlessly when the host already installed a logger
        if log::set_logger(&FacadeLogger).is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        }
    });
}

/// Route log records to `facade` until [`detach`] is called with `id`
pub(crate) fn attach(id: u64, facade: Arc<dyn Facade>) {
    init_logging();
    if let Some(level) = facade.log_level() {
        log::set_max_level(level);
    }
    let mut sinks = SINKS.write().unwrap_or_else(|e| e.into_inner());
    sinks.retain(|(sink_id, _)| *sink_id != id);
    sinks.push((id, facade));
}

pub(crate) fn detach(id: u64) {
    let mut sinks = SINKS.write().unwrap_or_else(|e| e.into_inner());
    sinks.retain(|(sink_id, _)| *sink_id != id);
}

/// Change the global log level at runtime
pub fn set_level(level: log::LevelFilter) {
    log::set_max_level(level);
}

struct FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Release the lock before calling out, sinks may log themselves
        let sinks: Vec<Arc<dyn Facade>> = SINKS
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        if sinks.is_empty() {
            return;
        }
        let line = format!("[{}] {}", record.target(), record.args());
        for sink in sinks {
            sink.on_log(record.level(), &line);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtcError;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl Facade for Capture {
        fn on_signaling(&self, _: &str, _: &str) -> Result<(), RtcError> {
            Ok(())
        }
        fn on_log(&self, _level: log::Level, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_logger_forwards_to_sink() {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        attach(u64::MAX, capture.clone());
        let emit = || {
            log::Log::log(
                &FacadeLogger,
                &log::Record::builder()
                    .level(log::Level::Error)
                    .target("p2p_rtc::test")
                    .args(format_args!("hello {}", 42))
                    .build(),
            )
        };
        emit();
        detach(u64::MAX);
        emit();

        let lines = capture.0.lock().unwrap();
        let hits = lines.iter().filter(|l| *l == "[p2p_rtc::test] hello 42").count();
        assert_eq!(hits, 1);
    }
}
