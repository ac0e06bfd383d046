use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log file name under the logs directory.
pub const LOG_FILE: &str = "vmfork.log";

/// Shared slot for the log file. Until [`LogSink::attach`] succeeds every
/// write is swallowed, so the subscriber can be installed before the data
/// directory has been resolved.
#[derive(Clone, Default)]
pub struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    fn slot(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to `path` from now on, creating parent directories first.
    pub fn attach(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.slot().replace(file);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.slot().is_some()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut slot = self.slot();
        let Some(file) = slot.as_mut() else {
            return Ok(buf.len());
        };
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.slot().as_mut().map_or(Ok(()), |file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn terminal_filter(verbose: bool) -> EnvFilter {
    match (std::env::var_os("RUST_LOG").is_some(), verbose) {
        (true, _) => EnvFilter::from_default_env(),
        (false, true) => EnvFilter::new("vmfork=debug"),
        (false, false) => EnvFilter::new("off"),
    }
}

/// Install the global subscriber: stderr for the operator (`RUST_LOG`, or
/// debug with `-v`) and a file layer that always records `vmfork=debug`.
pub fn init(verbose: bool) -> LogSink {
    let sink = LogSink::default();

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter(verbose));
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(sink.clone())
        .with_filter(EnvFilter::new("vmfork=debug"));

    tracing_subscriber::registry().with(stderr).with(file).init();
    sink
}

/// Point the sink at `<logs_dir>/vmfork.log`. Failure only costs the file log.
pub fn attach_file(sink: &LogSink, logs_dir: &Path) {
    let path = logs_dir.join(LOG_FILE);
    if let Err(e) = sink.attach(&path) {
        tracing::warn!(path = %path.display(), error = %e, "file logging disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_discarded_until_attached() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::default();

        sink.make_writer().write_all(b"early\n").unwrap();
        assert!(!sink.is_attached());

        let path = tmp.path().join("logs").join(LOG_FILE);
        sink.attach(&path).unwrap();
        sink.make_writer().write_all(b"late\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "late\n");
    }

    #[test]
    fn reattaching_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(LOG_FILE);
        for line in ["one\n", "two\n"] {
            let sink = LogSink::default();
            sink.attach(&path).unwrap();
            sink.make_writer().write_all(line.as_bytes()).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
