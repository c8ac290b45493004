//! Output interception
//!
//! While a run is in progress, every line the engine writes to stdout or
//! stderr, and every daemon log line, is forwarded to the run's event
//! stream as one `log` event per line. The passthrough write to the real
//! stream always happens; interception augments it, never replaces it.
//! Installation is a scoped acquisition: dropping the guard restores the
//! unintercepted state on every exit path, so nothing leaks into the next
//! run.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use super::channel::{EventSink, LogStream, RunEvent};

/// Interception point for run output
#[derive(Default)]
pub struct OutputRelay {
    slot: Mutex<Option<EventSink>>,
}

impl OutputRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<EventSink>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a forwarder for the duration of a run
    ///
    /// The returned guard removes it again when dropped. Installing over an
    /// existing forwarder replaces it; the single-flight guard makes that
    /// unreachable in practice.
    pub fn install(&self, sink: EventSink) -> RelayGuard<'_> {
        *self.slot() = Some(sink);
        RelayGuard { relay: self }
    }

    /// Whether a forwarder is currently installed
    pub fn is_installed(&self) -> bool {
        self.slot().is_some()
    }

    /// Write a line to the daemon's real stdout and forward it
    pub fn stdout_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        self.forward(LogStream::Stdout, line);
    }

    /// Write a line to the daemon's real stderr and forward it
    pub fn stderr_line(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{line}");
        self.forward(LogStream::Stderr, line);
    }

    /// Forward a daemon log line
    ///
    /// The passthrough write is handled by the regular stderr/file logging
    /// layers; this only mirrors the line into the event stream.
    pub fn daemon_line(&self, line: &str) {
        self.forward(LogStream::Daemon, line);
    }

    fn forward(&self, stream: LogStream, line: &str) {
        if let Some(sink) = self.slot().as_ref() {
            // A gone peer is detected by the coordinator's own sends; here
            // the failure is simply ignored.
            let _ = sink.send(RunEvent::Log {
                line: line.to_string(),
                stream,
            });
        }
    }
}

/// Scoped interception handle; restores the relay on drop
pub struct RelayGuard<'a> {
    relay: &'a OutputRelay,
}

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        self.relay.slot().take();
    }
}

/// `MakeWriter` bridging tracing output into the relay
///
/// Each formatted log line is forwarded as a `daemon` log event while a run
/// is in progress, and silently dropped otherwise.
#[derive(Clone)]
pub struct RelayLogWriter {
    relay: Arc<OutputRelay>,
}

impl RelayLogWriter {
    pub fn new(relay: Arc<OutputRelay>) -> Self {
        Self { relay }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RelayLogWriter {
    type Writer = RelayLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RelayLineWriter {
            relay: self.relay.clone(),
            buf: Vec::new(),
        }
    }
}

/// Line-buffering writer handed to the tracing formatter
pub struct RelayLineWriter {
    relay: Arc<OutputRelay>,
    buf: Vec<u8>,
}

impl RelayLineWriter {
    fn drain_complete_lines(&mut self) {
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.relay.daemon_line(&text);
        }
    }
}

impl Write for RelayLineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.drain_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for RelayLineWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let remainder = std::mem::take(&mut self.buf);
            let text = String::from_utf8_lossy(&remainder);
            self.relay.daemon_line(&text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::channel::event_channel;

    #[test]
    fn forwards_only_while_installed() {
        let relay = OutputRelay::new();
        let (sink, mut rx) = event_channel();

        relay.daemon_line("before install");
        assert!(rx.try_recv().is_err());

        {
            let _guard = relay.install(sink);
            assert!(relay.is_installed());
            relay.daemon_line("during");
        }

        assert!(!relay.is_installed());
        relay.daemon_line("after restore");

        match rx.try_recv() {
            Ok(RunEvent::Log { line, stream }) => {
                assert_eq!(line, "during");
                assert_eq!(stream, LogStream::Daemon);
            }
            other => panic!("expected the intercepted line, got {other:?}"),
        }
        // The previously installed forwarder observes nothing after restore
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn each_line_is_forwarded_exactly_once() {
        let relay = OutputRelay::new();
        let (sink, mut rx) = event_channel();
        let _guard = relay.install(sink);

        relay.stdout_line("one");
        relay.stderr_line("two");

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Log { line, stream } = event {
                seen.push((line, stream));
            }
        }
        assert_eq!(
            seen,
            vec![
                ("one".to_string(), LogStream::Stdout),
                ("two".to_string(), LogStream::Stderr),
            ]
        );
    }

    #[test]
    fn log_writer_splits_buffered_lines() {
        let relay = Arc::new(OutputRelay::new());
        let (sink, mut rx) = event_channel();
        let _guard = relay.install(sink);

        let mut writer = RelayLineWriter {
            relay: relay.clone(),
            buf: Vec::new(),
        };
        writer.write_all(b"first li").expect("write");
        assert!(rx.try_recv().is_err());
        writer.write_all(b"ne\nsecond\n").expect("write");

        let lines: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|ev| match ev {
                RunEvent::Log { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["first line".to_string(), "second".to_string()]);
    }

    #[test]
    fn log_writer_flushes_partial_line_on_drop() {
        let relay = Arc::new(OutputRelay::new());
        let (sink, mut rx) = event_channel();
        let _guard = relay.install(sink);

        {
            let mut writer = RelayLineWriter {
                relay: relay.clone(),
                buf: Vec::new(),
            };
            writer.write_all(b"tail without newline").expect("write");
        }

        match rx.try_recv() {
            Ok(RunEvent::Log { line, .. }) => assert_eq!(line, "tail without newline"),
            other => panic!("expected flushed tail, got {other:?}"),
        }
    }
}
