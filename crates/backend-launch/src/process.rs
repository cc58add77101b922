//! Streaming command execution.
//!
//! Runs a tool to completion while forwarding every stdout/stderr line to a
//! callback as it arrives. A non-zero exit is a normal result ([`ExitInfo`]);
//! only a failure to spawn the process at all is an error.

use std::process::{ExitStatus, Stdio};

use log::debug;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Name of the terminating signal (Unix only).
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let signal = self.signal.as_deref().unwrap_or("none");
        write!(f, "code {} and signal {}", code, signal)
    }
}

#[cfg(unix)]
fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", raw))
}

/// Line reader over child output that never stops on bad encoding.
///
/// Invalid UTF-8 is replaced with U+FFFD. Reading ends only at EOF or on an
/// I/O error, so the child never writes into a closed pipe.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.ends_with(b"\n") {
            self.buf.pop();
            if self.buf.ends_with(b"\r") {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Keep tool invocations from flashing a console window on Windows.
pub fn configure_no_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    let _ = cmd;
}

/// Run `cmd` to completion, forwarding each output line to `on_line`.
///
/// Stdout and stderr are read concurrently; lines from one stream keep their
/// order. Returns `Err` only if the process could not be spawned or waited on.
pub async fn run_streaming<F>(mut cmd: Command, on_line: F) -> std::io::Result<ExitInfo>
where
    F: Fn(OutputStream, &str) + Send + Sync,
{
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    configure_no_window(&mut cmd);

    let mut child = cmd.spawn()?;
    debug!("[process] Spawned {:?} (pid {:?})", cmd.as_std(), child.id());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::join!(
        forward_lines(stdout, OutputStream::Stdout, &on_line),
        forward_lines(stderr, OutputStream::Stderr, &on_line),
    );

    let status = child.wait().await?;
    Ok(ExitInfo::from(status))
}

async fn forward_lines<R, F>(reader: Option<R>, stream: OutputStream, on_line: &F)
where
    R: AsyncRead + Unpin,
    F: Fn(OutputStream, &str),
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = OutputLines::new(reader);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(stream, &line),
            Ok(None) => break,
            Err(e) => {
                debug!("[process] Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn test_streams_both_outputs() {
        let lines = Mutex::new(Vec::new());
        let exit = run_streaming(sh("echo out1; echo err1 >&2; echo out2"), |stream, line| {
            lines.lock().unwrap().push((stream, line.to_string()));
        })
        .await
        .unwrap();

        assert!(exit.success());
        let lines = lines.into_inner().unwrap();
        let stdout: Vec<_> = lines
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["out1", "out2"]);
        assert!(lines
            .iter()
            .any(|(s, l)| *s == OutputStream::Stderr && l == "err1"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let exit = run_streaming(sh("exit 3"), |_, _| {}).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let cmd = Command::new("/nonexistent/definitely-not-a-tool");
        assert!(run_streaming(cmd, |_, _| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_stop_reading() {
        let lines = Mutex::new(Vec::new());
        let exit = run_streaming(
            sh(r"printf 'Downloading caf\351\n'; echo after"),
            |_, line| lines.lock().unwrap().push(line.to_string()),
        )
        .await
        .unwrap();

        assert!(exit.success(), "exited with {}", exit);
        let lines = lines.into_inner().unwrap();
        assert_eq!(lines, vec!["Downloading caf\u{FFFD}", "after"]);
    }

    #[tokio::test]
    async fn test_crlf_and_unterminated_last_line() {
        let lines = Mutex::new(Vec::new());
        run_streaming(sh(r"printf 'one\r\ntwo'"), |_, line| {
            lines.lock().unwrap().push(line.to_string())
        })
        .await
        .unwrap();
        assert_eq!(lines.into_inner().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_signal_name_reported() {
        let exit = run_streaming(sh("kill -TERM $$"), |_, _| {}).await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
    }
}
