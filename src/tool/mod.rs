//! External tool invocation.
//!
//! Metadata extraction (`modinfo`) and stream filters (`gzip`, `xz`) are
//! reached only through [`ToolRunner`], so inspection and compression can be
//! exercised in tests without the real binaries.
//!
//! # Example
//!
//! ```rust,ignore
//! use initramfs_builder::tool::{SystemToolRunner, ToolCommand, ToolRunner};
//! use std::time::Duration;
//!
//! let runner = SystemToolRunner::new(Duration::from_secs(30));
//! let packed = runner.run(&ToolCommand::new("gzip").args(["-n", "-9", "-c"]).stdin(b"data"))?;
//! ```

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{BuildError, BuildResult};

/// Default upper bound for one tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single tool invocation: program, arguments and optional stdin payload.
#[derive(Debug, Clone)]
pub struct ToolCommand<'a> {
    program: &'a str,
    args: Vec<OsString>,
    stdin: Option<&'a [u8]>,
}

impl<'a> ToolCommand<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str().to_os_string())
    }

    /// Feed `bytes` to the tool's stdin.
    pub fn stdin(mut self, bytes: &'a [u8]) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn program(&self) -> &str {
        self.program
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    pub fn input(&self) -> Option<&'a [u8]> {
        self.stdin
    }
}

/// Capability to run an external tool and capture its stdout.
///
/// Implementations must fail with [`BuildError::ToolUnavailable`] when the
/// program does not exist, [`BuildError::ToolTimeout`] when it hangs and
/// [`BuildError::ToolFailed`] on a non-zero exit.
pub trait ToolRunner: Send + Sync {
    fn run(&self, cmd: &ToolCommand<'_>) -> BuildResult<Vec<u8>>;

    /// Whether `tool` can be run at all. Used by preflight.
    fn is_available(&self, tool: &str) -> bool {
        tool_exists(tool)
    }
}

/// Runs tools from `PATH` with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct SystemToolRunner {
    timeout: Duration,
}

impl SystemToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemToolRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolRunner for SystemToolRunner {
    fn run(&self, cmd: &ToolCommand<'_>) -> BuildResult<Vec<u8>> {
        let tool = cmd.program().to_string();
        let program = which::which(cmd.program())
            .map_err(|_| BuildError::ToolUnavailable { tool: tool.clone() })?;

        let mut child = Command::new(&program)
            .args(cmd.arg_list())
            .stdin(if cmd.input().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::io(format!("spawning {}", program.display()), e))?;

        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| {
            BuildError::io(
                format!("capturing stdout of {tool}"),
                std::io::Error::other("stdout not piped"),
            )
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            BuildError::io(
                format!("capturing stderr of {tool}"),
                std::io::Error::other("stderr not piped"),
            )
        })?;
        let deadline = Instant::now() + self.timeout;

        // Writer and readers run beside the wait loop so a chatty tool can
        // never deadlock on a full pipe. They are not scoped: a grandchild
        // that inherited the pipes must not hold us past a timeout kill.
        if let (Some(mut pipe), Some(bytes)) = (stdin, cmd.input()) {
            let bytes = bytes.to_vec();
            std::thread::spawn(move || {
                // EPIPE here just means the tool exited early; its exit
                // status tells the real story.
                let _ = pipe.write_all(&bytes);
            });
        }
        let out = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });
        let err = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BuildError::ToolTimeout {
                        tool,
                        timeout: self.timeout,
                    });
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BuildError::io(format!("waiting for {tool}"), e));
                }
            }
        };

        let stdout = out
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdout reader panicked")))
            .map_err(|e| BuildError::io(format!("reading output of {tool}"), e))?;
        let stderr = err.join().unwrap_or_default();

        if !status.success() {
            return Err(BuildError::ToolFailed {
                tool,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Check if a tool exists on the host system.
pub fn tool_exists(tool: &str) -> bool {
    which::which(tool).is_ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_feeds_stdin() {
        let runner = SystemToolRunner::default();
        let out = runner
            .run(&ToolCommand::new("cat").stdin(b"round trip"))
            .unwrap();
        assert_eq!(out, b"round trip");
    }

    #[test]
    fn missing_tool_is_unavailable() {
        let runner = SystemToolRunner::default();
        let err = runner
            .run(&ToolCommand::new("definitely_not_a_real_command_12345"))
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolUnavailable { .. }));
    }

    #[test]
    fn non_zero_exit_is_failure() {
        let runner = SystemToolRunner::default();
        let err = runner
            .run(&ToolCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        match err {
            BuildError::ToolFailed { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hang_becomes_timeout() {
        let runner = SystemToolRunner::new(Duration::from_millis(200));
        let started = Instant::now();
        let err = runner
            .run(&ToolCommand::new("sleep").arg("10"))
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_does_not_wait_for_inherited_pipes() {
        let runner = SystemToolRunner::new(Duration::from_millis(200));
        let started = Instant::now();
        // The background sleep outlives the kill and keeps stdout open.
        let err = runner
            .run(&ToolCommand::new("sh").args(["-c", "sleep 10 & exec sleep 10"]))
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn tool_exists_checks_path() {
        assert!(tool_exists("sh"));
        assert!(!tool_exists("definitely_not_a_real_command_12345"));
    }
}
