//! Concurrent draining of a spawned process's output streams
//!
//! Each pipe gets its own reader task feeding a single collector over a
//! bounded channel. The collector fans lines out to the log file, the
//! tracing sink, the local stdio and the capture buffers. Neither pipe is
//! ever left unread while the other one is waited on.

use crate::error::CancelReason;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines buffered between the pipe readers and the collector
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Bytes of stderr kept for diagnostics when output is not captured
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of process output, including its trailing newline if it had one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Source pipe
    pub stream: StreamKind,
    /// Line text (lossy UTF-8)
    pub text: String,
}

/// Where drained output goes
#[derive(Debug, Clone, Default)]
pub struct DrainConfig {
    /// Label attached to streamed log events, normally the node address
    pub label: String,
    /// Emit each line as a tracing event on `fleetrun::output`
    pub stream_logs: bool,
    /// Copy lines to this process's stdout/stderr
    pub echo_to_stdio: bool,
    /// Keep full stdout/stderr in memory
    pub capture: bool,
    /// Keep stderr apart from stdout in the capture buffers
    pub separate_stderr: bool,
    /// Programmatic line receiver
    pub sink: Option<mpsc::UnboundedSender<OutputLine>>,
}

/// External abort conditions for an in-flight process
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    /// Caller-held token
    pub token: Option<CancellationToken>,
    /// Upper bound on the time spent draining
    pub deadline: Option<Duration>,
}

impl Cancellation {
    /// Resolves when the token fires or the deadline elapses; never otherwise
    pub async fn fired(&self) -> CancelReason {
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = token => CancelReason::Requested,
            _ = deadline => CancelReason::Deadline,
        }
    }
}

/// Raw chunk as read from a pipe, before any text conversion
struct RawLine {
    stream: StreamKind,
    bytes: Vec<u8>,
}

/// Final state of a drained process
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code, -1 when killed by a signal
    pub status: i32,
    /// Captured stdout (merged output when stderr is not separate)
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Last few KiB of stderr, kept regardless of capture
    pub stderr_tail: String,
    /// Wall time from drain start to exit
    pub duration: Duration,
}

/// Why draining stopped early
#[derive(Debug)]
pub enum DrainError {
    /// Cancellation fired; the process was killed and reaped
    Cancelled(CancelReason),
    /// Reading a pipe, writing the log or waiting on the process failed
    Io(io::Error),
}

/// Open `path` for appending, creating it if needed.
///
/// Every invocation gets its own handle so concurrent runs sharing a log
/// path only ever issue append writes.
pub async fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Drain `child` until it exits, or until `cancel` fires.
///
/// Returns only after the process has been reaped and both pipes hit EOF.
/// On cancellation the process is killed and partial captured output is
/// dropped; whatever was already read still reaches the log file.
pub async fn drain_process(
    mut child: Child,
    log: Option<File>,
    config: &DrainConfig,
    cancel: &Cancellation,
) -> Result<ProcessOutcome, DrainError> {
    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    let mut readers: Vec<JoinHandle<io::Result<()>>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, StreamKind::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, StreamKind::Stderr, tx.clone())));
    }
    drop(tx);

    let mut collector = Collector::new(config, log);

    let drained = async {
        while let Some(line) = rx.recv().await {
            collector.accept(line).await?;
        }
        collector.flush().await?;
        let status = child.wait().await?;
        Ok::<ExitStatus, io::Error>(status)
    };

    let finished: Result<io::Result<ExitStatus>, CancelReason> = tokio::select! {
        result = drained => Ok(result),
        reason = cancel.fired() => Err(reason),
    };

    match finished {
        Ok(Ok(status)) => {
            for reader in readers {
                match reader.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(DrainError::Io(e)),
                    Err(e) => warn!("Output reader task failed: {}", e),
                }
            }

            let outcome = ProcessOutcome {
                status: status.code().unwrap_or(-1),
                stdout: collector.stdout,
                stderr: collector.stderr,
                stderr_tail: collector.stderr_tail,
                duration: start.elapsed(),
            };
            debug!(
                "Process for {} exited with {} after {:?}",
                config.label, outcome.status, outcome.duration
            );
            Ok(outcome)
        }
        Ok(Err(e)) => {
            abort_readers(&readers);
            reap(&mut child).await;
            collector.salvage_log(&mut rx).await;
            Err(DrainError::Io(e))
        }
        Err(reason) => {
            debug!("Killing process for {}: {}", config.label, reason);
            abort_readers(&readers);
            reap(&mut child).await;
            collector.salvage_log(&mut rx).await;
            Err(DrainError::Cancelled(reason))
        }
    }
}

fn abort_readers(readers: &[JoinHandle<io::Result<()>>]) {
    for reader in readers {
        reader.abort();
    }
}

async fn reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Kill failed, process likely already exited: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Error waiting for killed process: {}", e);
    }
}

async fn read_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<RawLine>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = RawLine {
            stream,
            bytes: std::mem::take(&mut buf),
        };
        if tx.send(line).await.is_err() {
            // Collector is gone; nothing left to deliver to.
            return Ok(());
        }
    }
}

struct Collector<'a> {
    config: &'a DrainConfig,
    log: Option<BufWriter<File>>,
    stdout: String,
    stderr: String,
    stderr_tail: String,
}

impl<'a> Collector<'a> {
    fn new(config: &'a DrainConfig, log: Option<File>) -> Self {
        Self {
            config,
            log: log.map(BufWriter::new),
            stdout: String::new(),
            stderr: String::new(),
            stderr_tail: String::new(),
        }
    }

    async fn accept(&mut self, raw: RawLine) -> io::Result<()> {
        // The log and local stdio get the bytes exactly as the process wrote them.
        if let Some(log) = self.log.as_mut() {
            log.write_all(&raw.bytes).await?;
        }

        if self.config.echo_to_stdio {
            match raw.stream {
                StreamKind::Stdout => {
                    let mut out = tokio::io::stdout();
                    out.write_all(&raw.bytes).await?;
                    out.flush().await?;
                }
                StreamKind::Stderr => {
                    let mut err = tokio::io::stderr();
                    err.write_all(&raw.bytes).await?;
                    err.flush().await?;
                }
            }
        }

        let line = OutputLine {
            stream: raw.stream,
            text: String::from_utf8_lossy(&raw.bytes).into_owned(),
        };

        if self.config.stream_logs {
            info!(
                target: "fleetrun::output",
                node = %self.config.label,
                stream = %line.stream,
                "{}",
                line.text.trim_end_matches(['\r', '\n'])
            );
        }

        if line.stream == StreamKind::Stderr {
            push_tail(&mut self.stderr_tail, &line.text);
        }

        if self.config.capture {
            match line.stream {
                StreamKind::Stderr if self.config.separate_stderr => {
                    self.stderr.push_str(&line.text)
                }
                _ => self.stdout.push_str(&line.text),
            }
        }

        if let Some(sink) = &self.config.sink {
            // A dropped receiver only means the caller stopped listening.
            let _ = sink.send(line);
        }

        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.flush().await?;
        }
        Ok(())
    }

    /// Best-effort write of everything already read to the log after an abort.
    ///
    /// Lines still queued in the channel go to the log only; captures and
    /// sinks are not fed once the call has failed.
    async fn salvage_log(&mut self, rx: &mut mpsc::Receiver<RawLine>) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        while let Ok(raw) = rx.try_recv() {
            if let Err(e) = log.write_all(&raw.bytes).await {
                warn!("Failed to write log for {}: {}", self.config.label, e);
                return;
            }
        }
        if let Err(e) = log.flush().await {
            warn!("Failed to flush log for {}: {}", self.config.label, e);
        }
    }
}

fn push_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn capture_config() -> DrainConfig {
        DrainConfig {
            label: "local".to_string(),
            capture: true,
            separate_stderr: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_drain_captures_both_streams() {
        let child = spawn_sh("echo out; echo err >&2; exit 3");
        let outcome = drain_process(child, None, &capture_config(), &Cancellation::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, 3);
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.stderr_tail, "err\n");
    }

    #[tokio::test]
    async fn test_drain_merges_stderr_when_not_separate() {
        let child = spawn_sh("echo one; echo two >&2");
        let config = DrainConfig {
            separate_stderr: false,
            ..capture_config()
        };
        let outcome = drain_process(child, None, &config, &Cancellation::default())
            .await
            .unwrap();

        assert!(outcome.stderr.is_empty());
        assert!(outcome.stdout.contains("one\n"));
        assert!(outcome.stdout.contains("two\n"));
    }

    #[tokio::test]
    async fn test_drain_without_capture_keeps_tail_only() {
        let child = spawn_sh("echo quiet; echo diag >&2");
        let config = DrainConfig {
            label: "local".to_string(),
            ..Default::default()
        };
        let outcome = drain_process(child, None, &config, &Cancellation::default())
            .await
            .unwrap();

        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
        assert_eq!(outcome.stderr_tail, "diag\n");
    }

    #[tokio::test]
    async fn test_heavy_output_on_both_streams_does_not_deadlock() {
        // Each stream writes well past the 64 KiB pipe buffer.
        let script = "i=0; while [ $i -lt 20000 ]; do echo \"out $i\"; echo \"err $i\" >&2; i=$((i+1)); done";
        let child = spawn_sh(script);

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            drain_process(child, None, &capture_config(), &Cancellation::default()),
        )
        .await
        .expect("drain deadlocked")
        .unwrap();

        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.stdout.lines().count(), 20000);
        assert_eq!(outcome.stderr.lines().count(), 20000);
        assert_eq!(outcome.stdout.lines().last(), Some("out 19999"));
        assert!(outcome.stderr_tail.len() <= STDERR_TAIL_BYTES);
        assert!(outcome.stderr_tail.ends_with("err 19999\n"));
    }

    #[tokio::test]
    async fn test_silent_stream_does_not_block() {
        let child = spawn_sh("sleep 0.2; echo done");
        let outcome = drain_process(child, None, &capture_config(), &Cancellation::default())
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "done\n");
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_log_file_and_sink_receive_output() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs").join("run.log");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = DrainConfig {
            sink: Some(tx),
            stream_logs: true,
            ..capture_config()
        };

        let log = open_log(&log_path).await.unwrap();
        let child = spawn_sh("echo first; echo second >&2");
        drain_process(child, Some(log), &config, &Cancellation::default())
            .await
            .unwrap();

        // Append mode: a second run adds to the same file.
        let log = open_log(&log_path).await.unwrap();
        let child = spawn_sh("echo third");
        drain_process(child, Some(log), &config, &Cancellation::default())
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(contents.contains("first\n"));
        assert!(contents.contains("second\n"));
        assert!(contents.ends_with("third\n"));

        drop(config);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&OutputLine {
            stream: StreamKind::Stderr,
            text: "second\n".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let token = CancellationToken::new();
        let cancel = Cancellation {
            token: Some(token.clone()),
            deadline: None,
        };

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let child = spawn_sh("echo started; sleep 30");
        let start = Instant::now();
        let result = drain_process(child, None, &capture_config(), &cancel).await;

        assert!(matches!(
            result,
            Err(DrainError::Cancelled(CancelReason::Requested))
        ));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_deadline_cancels() {
        let cancel = Cancellation {
            token: None,
            deadline: Some(Duration::from_millis(100)),
        };
        let child = spawn_sh("sleep 30");
        let result = drain_process(child, None, &capture_config(), &cancel).await;

        assert!(matches!(
            result,
            Err(DrainError::Cancelled(CancelReason::Deadline))
        ));
    }

    #[tokio::test]
    async fn test_log_keeps_output_written_before_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("cancelled.log");
        let cancel = Cancellation {
            token: None,
            deadline: Some(Duration::from_millis(500)),
        };

        let log = open_log(&log_path).await.unwrap();
        let child = spawn_sh("echo started; sleep 30");
        let result = drain_process(child, Some(log), &capture_config(), &cancel).await;
        assert!(matches!(
            result,
            Err(DrainError::Cancelled(CancelReason::Deadline))
        ));

        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert_eq!(contents, "started\n");
    }

    #[tokio::test]
    async fn test_log_receives_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("binary.log");

        let log = open_log(&log_path).await.unwrap();
        let child = spawn_sh("printf 'ok \\377\\376\\n'");
        let outcome = drain_process(child, Some(log), &capture_config(), &Cancellation::default())
            .await
            .unwrap();

        let bytes = tokio::fs::read(&log_path).await.unwrap();
        assert_eq!(bytes, b"ok \xff\xfe\n");
        assert_eq!(outcome.stdout, "ok \u{fffd}\u{fffd}\n");
    }

    #[test]
    fn test_push_tail_respects_char_boundaries() {
        let mut tail = String::new();
        let chunk = "é".repeat(STDERR_TAIL_BYTES);
        push_tail(&mut tail, &chunk);
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.chars().all(|c| c == 'é'));
    }
}
