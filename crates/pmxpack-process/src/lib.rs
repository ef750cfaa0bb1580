//! External command execution for the collection pipeline.
//!
//! Inventory entries and the cloud sync tool are driven through this
//! crate: commands are given as whitespace-separated strings, run under
//! the shared cancellation token with a deadline, and their combined
//! output is captured both in memory and (for report commands) in a file
//! inside the staging tree.
//!
//! Failure handling follows the criticality flag: a critical command
//! failure surfaces as an error, a non-critical one is downgraded to a
//! warning carrying a truncated single-line summary of the output.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use pmxpack_types::{CancelToken, Cancelled};

/// Maximum length of the single-line output summary attached to warnings.
pub const SUMMARY_LIMIT: usize = 2048;

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (or -1 when not available)
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// Whether execution exceeded the timeout.
    pub timed_out: bool,
    /// Total wall-clock duration.
    #[serde(with = "humantime_duration")]
    pub duration: Duration,
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Combined stdout + stderr, in that order.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = self.stdout.clone();
        out.extend_from_slice(&self.stderr);
        out
    }
}

/// Outcome of a capture-style invocation.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Combined output bytes (empty when the command failed non-critically
    /// or was skipped).
    pub output: Vec<u8>,
    /// Warning text when a non-critical failure or skip occurred.
    pub warning: Option<String>,
    /// True when the command was skipped (missing binary or credentials).
    pub skipped: bool,
}

impl CaptureResult {
    fn ok(output: Vec<u8>) -> Self {
        Self { output, warning: None, skipped: false }
    }

    fn warned(warning: String) -> Self {
        Self { output: Vec::new(), warning: Some(warning), skipped: false }
    }

    fn skipped(warning: String) -> Self {
        Self { output: Vec::new(), warning: Some(warning), skipped: true }
    }
}

/// Split a whitespace-separated command string into program and arguments.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().context("empty command string")?;
    Ok((program, parts.collect()))
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Produce a single-line summary of combined output, truncated to
/// [`SUMMARY_LIMIT`] bytes on a char boundary.
pub fn summarize_output(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let mut line = text
        .split(['\n', '\r'])
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    if line.len() > SUMMARY_LIMIT {
        let mut cut = SUMMARY_LIMIT;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }
    line
}

/// Command runner bound to the run's cancellation token and default
/// subprocess deadline.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cancel: CancelToken,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(cancel: CancelToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }

    /// Run a command and write its combined output to `output_file`.
    ///
    /// On any failure the partial output file is removed so a half-written
    /// report never poisons the archive. Critical failures surface as
    /// errors; non-critical ones return a warning summary.
    pub fn capture(&self, command: &str, critical: bool, output_file: &Path) -> Result<CaptureResult> {
        self.capture_with_env(command, critical, output_file, &[])
    }

    /// Like [`CommandRunner::capture`] but additionally copies the output
    /// to the given secondary paths.
    pub fn mirror(
        &self,
        command: &str,
        critical: bool,
        output_file: &Path,
        mirrors: &[PathBuf],
    ) -> Result<CaptureResult> {
        let result = self.capture(command, critical, output_file)?;
        if result.warning.is_none() {
            for mirror in mirrors {
                if let Some(parent) = mirror.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create mirror dir {}", parent.display())
                    })?;
                }
                fs::write(mirror, &result.output)
                    .with_context(|| format!("failed to write mirror {}", mirror.display()))?;
            }
        }
        Ok(result)
    }

    /// Best-effort invocation: every failure is downgraded to a warning.
    pub fn optional(&self, command: &str, output_file: &Path) -> Result<CaptureResult> {
        self.capture(command, false, output_file)
    }

    /// Run a command with credential environment variables appended.
    ///
    /// When a required credential is absent the call is skipped with a
    /// warning rather than attempted without it.
    pub fn authenticated(
        &self,
        command: &str,
        critical: bool,
        output_file: &Path,
        credentials: &[(&str, Option<String>)],
    ) -> Result<CaptureResult> {
        let mut env = Vec::with_capacity(credentials.len());
        for (name, value) in credentials {
            match value {
                Some(v) => env.push((name.to_string(), v.clone())),
                None => {
                    return Ok(CaptureResult::skipped(format!(
                        "skipping `{}`: credential {} is not set",
                        command, name
                    )));
                }
            }
        }
        self.capture_with_env(command, critical, output_file, &env)
    }

    fn capture_with_env(
        &self,
        command: &str,
        critical: bool,
        output_file: &Path,
        env: &[(String, String)],
    ) -> Result<CaptureResult> {
        let (program, args) = split_command(command)?;

        if !command_exists(&program) {
            if critical {
                bail!("required command not found on PATH: {}", program);
            }
            return Ok(CaptureResult::skipped(format!(
                "skipping `{}`: binary not found on PATH",
                program
            )));
        }

        let run = self.run_with_timeout(&program, &args, env, self.timeout);
        let output = match run {
            Ok(output) => output,
            Err(err) => {
                remove_partial(output_file);
                if err.is::<Cancelled>() || critical {
                    return Err(err.context(format!("command `{}` failed", command)));
                }
                return Ok(CaptureResult::warned(format!("`{}` failed: {:#}", command, err)));
            }
        };

        let combined = output.combined();
        if !output.success() {
            remove_partial(output_file);
            let summary = summarize_output(&combined);
            if critical {
                if output.timed_out {
                    bail!(
                        "command `{}` timed out after {}: {}",
                        command,
                        humantime::format_duration(self.timeout),
                        summary
                    );
                }
                bail!("command `{}` exited with {}: {}", command, output.exit_code, summary);
            }
            return Ok(CaptureResult::warned(format!(
                "`{}` exited with {}: {}",
                command, output.exit_code, summary
            )));
        }

        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }
        fs::write(output_file, &combined)
            .with_context(|| format!("failed to write {}", output_file.display()))?;

        Ok(CaptureResult::ok(combined))
    }

    /// Run a program with arguments under the runner's cancellation token
    /// and an explicit deadline, capturing stdout and stderr.
    pub fn run_with_timeout(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.cancel.checkpoint()?;
        let start = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn command: {}", program))?;

        // Drain the pipes on separate threads so a chatty child never
        // blocks on a full pipe buffer while we poll for exit.
        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let deadline = start + timeout;
        let status = loop {
            if self.cancel.is_cancelled() {
                kill_and_reap(&mut child);
                join_reader(stdout_reader);
                join_reader(stderr_reader);
                return Err(Cancelled.into());
            }

            match child
                .try_wait()
                .with_context(|| format!("failed to poll command: {}", program))?
            {
                Some(status) => break Some(status),
                None => {
                    if Instant::now() >= deadline {
                        kill_and_reap(&mut child);
                        break None;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        match status {
            Some(status) => Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                timed_out: false,
                duration: start.elapsed(),
            }),
            None => Ok(CommandOutput {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
                duration: start.elapsed(),
            }),
        }
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    stream: Option<R>,
) -> Option<thread::JoinHandle<Vec<u8>>> {
    stream.map(|mut s| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = s.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn remove_partial(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(CancelToken::new(), Duration::from_secs(30))
    }

    #[test]
    fn split_command_parses_whitespace() {
        let (program, args) = split_command("tar --version").expect("split");
        assert_eq!(program, "tar");
        assert_eq!(args, vec!["--version".to_string()]);
    }

    #[test]
    fn split_command_rejects_empty() {
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn capture_writes_output_file() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("reports/version.txt");
        let result = runner().capture("sh -c echo", true, &out).expect("capture");
        assert!(result.warning.is_none());
        assert!(out.exists());
    }

    #[test]
    fn capture_removes_partial_file_on_failure() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        fs::write(&out, b"stale").expect("seed file");

        let result = runner().capture("false", false, &out).expect("capture");
        assert!(result.warning.is_some());
        assert!(!out.exists());
    }

    #[test]
    fn critical_failure_is_an_error() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        assert!(runner().capture("false", true, &out).is_err());
    }

    #[test]
    fn missing_binary_skips_when_not_critical() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        let result = runner()
            .capture("pmxpack-no-such-binary-xyz", false, &out)
            .expect("capture");
        assert!(result.skipped);
        assert!(result.warning.unwrap().contains("not found"));
    }

    #[test]
    fn missing_binary_fails_when_critical() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        assert!(runner().capture("pmxpack-no-such-binary-xyz", true, &out).is_err());
    }

    #[test]
    fn mirror_copies_to_secondary_paths() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("primary.txt");
        let second = td.path().join("mirror/copy.txt");
        let result = runner()
            .mirror("uname -s", true, &out, std::slice::from_ref(&second))
            .expect("mirror");
        assert!(result.warning.is_none());
        assert_eq!(fs::read(&out).expect("read"), fs::read(&second).expect("read"));
    }

    #[test]
    fn authenticated_skips_without_credentials() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        let result = runner()
            .authenticated("uname -s", true, &out, &[("PBS_PASSWORD", None)])
            .expect("authenticated");
        assert!(result.skipped);
        assert!(result.warning.unwrap().contains("PBS_PASSWORD"));
    }

    #[test]
    fn authenticated_passes_env_through() {
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        let result = runner()
            .authenticated(
                "sh -c env",
                true,
                &out,
                &[("PMX_TEST_CRED", Some("sekrit".to_string()))],
            )
            .expect("authenticated");
        assert!(result.warning.is_none());
    }

    #[test]
    fn timeout_kills_the_child() {
        let fast = CommandRunner::new(CancelToken::new(), Duration::from_millis(200));
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        let result = fast.capture("sleep 30", false, &out).expect("capture");
        assert!(result.warning.is_some());
        assert!(!out.exists());
    }

    #[test]
    fn cancellation_surfaces_as_sentinel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let cancelled = CommandRunner::new(cancel, Duration::from_secs(5));
        let td = tempdir().expect("tempdir");
        let out = td.path().join("report.txt");
        let err = cancelled.capture("uname -s", false, &out).unwrap_err();
        assert!(err.is::<Cancelled>());
    }

    #[test]
    fn summarize_collapses_and_truncates() {
        let summary = summarize_output(b"line one\nline two\n\n");
        assert_eq!(summary, "line one; line two");

        let long = vec![b'x'; SUMMARY_LIMIT * 2];
        assert_eq!(summarize_output(&long).len(), SUMMARY_LIMIT);
    }
}
