/// Bounded output collection for child processes.
/// Each stream is drained on its own thread so a chatty child never blocks on
/// a full pipe; bytes past the limit are read and discarded.
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::Child;
use std::thread::{self, JoinHandle};

/// How completely a stream was captured
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputIntegrity {
    Complete,
    /// The stream produced more than the per-stream limit
    Truncated,
    /// Reading failed part way
    ReadError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::Truncated => write!(f, "truncated"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

/// Output limits configuration
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    /// Per-stream limit (bytes)
    pub stream_limit: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stream_limit: 1024 * 1024,
        }
    }
}

/// Captured stdout/stderr of one child
#[derive(Debug, Clone, Default)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_integrity: Option<OutputIntegrity>,
    pub stderr_integrity: Option<OutputIntegrity>,
}

impl CollectedOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, as shown on a terminal
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        text.push_str(&self.stderr_text());
        text
    }

    pub fn truncated(&self) -> bool {
        matches!(self.stdout_integrity, Some(OutputIntegrity::Truncated))
            || matches!(self.stderr_integrity, Some(OutputIntegrity::Truncated))
    }
}

type StreamHandle = JoinHandle<(Vec<u8>, OutputIntegrity)>;

/// Collector threads attached to a running child
pub struct PendingOutput {
    stdout: Option<StreamHandle>,
    stderr: Option<StreamHandle>,
}

impl PendingOutput {
    /// Join the collector threads. Call after the child has been reaped.
    pub fn finish(self) -> CollectedOutput {
        let (stdout, stdout_integrity) = join_stream(self.stdout);
        let (stderr, stderr_integrity) = join_stream(self.stderr);
        CollectedOutput {
            stdout,
            stderr,
            stdout_integrity,
            stderr_integrity,
        }
    }
}

fn join_stream(handle: Option<StreamHandle>) -> (Vec<u8>, Option<OutputIntegrity>) {
    match handle.map(|h| h.join()) {
        Some(Ok((data, integrity))) => (data, Some(integrity)),
        Some(Err(_)) => (Vec::new(), Some(OutputIntegrity::ReadError)),
        None => (Vec::new(), None),
    }
}

/// Output collector with bounded collection
pub struct OutputCollector {
    limits: OutputLimits,
}

impl OutputCollector {
    pub fn new(limits: OutputLimits) -> Self {
        OutputCollector { limits }
    }

    /// Take the child's piped streams and start draining them
    pub fn start(&self, child: &mut Child) -> PendingOutput {
        let limit = self.limits.stream_limit;
        PendingOutput {
            stdout: child
                .stdout
                .take()
                .map(|stream| thread::spawn(move || collect_stream(stream, limit))),
            stderr: child
                .stderr
                .take()
                .map(|stream| thread::spawn(move || collect_stream(stream, limit))),
        }
    }
}

/// Collect from a single stream with limit
fn collect_stream<R: Read>(mut stream: R, limit: usize) -> (Vec<u8>, OutputIntegrity) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut integrity = OutputIntegrity::Complete;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buffer.len());
                if n > room {
                    buffer.extend_from_slice(&chunk[..room]);
                    integrity = OutputIntegrity::Truncated;
                } else {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                if integrity == OutputIntegrity::Complete {
                    integrity = OutputIntegrity::ReadError;
                }
                break;
            }
        }
    }

    (buffer, integrity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_stream_within_limit() {
        let (data, integrity) = collect_stream(&b"hello"[..], 16);
        assert_eq!(data, b"hello");
        assert_eq!(integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn test_collect_stream_truncates_but_drains() {
        let input = vec![b'x'; 10_000];
        let (data, integrity) = collect_stream(&input[..], 100);
        assert_eq!(data.len(), 100);
        assert_eq!(integrity, OutputIntegrity::Truncated);
    }

    #[test]
    fn test_combined_text_orders_stdout_first() {
        let output = CollectedOutput {
            stdout: b"out\n".to_vec(),
            stderr: b"err\n".to_vec(),
            stdout_integrity: Some(OutputIntegrity::Complete),
            stderr_integrity: Some(OutputIntegrity::Complete),
        };
        assert_eq!(output.combined_text(), "out\nerr\n");
        assert!(!output.truncated());
    }

    #[test]
    fn test_output_integrity_display() {
        assert_eq!(OutputIntegrity::Complete.to_string(), "complete");
        assert_eq!(OutputIntegrity::Truncated.to_string(), "truncated");
    }
}
