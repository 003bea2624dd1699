//! External command execution.
//!
//! All subprocess interaction goes through `CmdRunner` so that dry-run
//! handling and error mapping live in one place. Calls are blocking with
//! no timeout; callers that need one should wrap at this boundary.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::error::{Error, Result};

/// Runs external commands on behalf of the engine.
///
/// In dry-run mode, mutating invocations are skipped and fabricated as
/// successful (empty output); read-only invocations always execute.
#[derive(Debug, Clone)]
pub struct CmdRunner {
    dry_run: bool,
}

impl CmdRunner {
    pub fn new(dry_run: bool) -> Self {
        CmdRunner { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs a read-only command and returns its stdout.
    ///
    /// # Errors
    ///
    /// `Error::Process` on spawn failure or non-zero exit, with stderr
    /// included in the detail.
    pub fn run(&self, argv: &[&str]) -> Result<String> {
        debug!("run: {}", argv.join(" "));
        exec_capture(argv)
    }

    /// Runs a mutating command, or fabricates success in dry-run mode.
    pub fn run_mutating(&self, argv: &[&str]) -> Result<String> {
        if self.dry_run {
            info!("dry-run: would execute: {}", argv.join(" "));
            return Ok(String::new());
        }
        self.run(argv)
    }

    /// Runs a read-only probe where a non-zero exit is a meaningful "not
    /// found" signal rather than an error. Returns `None` on non-zero
    /// exit, `Some(stdout)` on success.
    ///
    /// # Errors
    ///
    /// Only spawn failures are errors; the exit status never is.
    pub fn run_soft(&self, argv: &[&str]) -> Result<Option<String>> {
        debug!("probe: {}", argv.join(" "));
        let (cmd, args) = split_argv(argv)?;
        let out = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_err(argv, &e))?;
        if out.status.success() {
            Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }

    /// Runs a read-only command, writing `input` to its stdin while
    /// draining stdout line by line.
    ///
    /// Output is drained on a separate thread while stdin is still being
    /// written; writing everything first and reading afterwards would
    /// deadlock once either pipe buffer fills.
    pub fn stream_lines(&self, argv: &[&str], input: Option<&str>) -> Result<Vec<String>> {
        debug!("stream: {}", argv.join(" "));
        let (cmd, args) = split_argv(argv)?;
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_err(argv, &e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".into()))?;
        let reader = std::thread::spawn(move || -> std::io::Result<Vec<String>> {
            BufReader::new(stdout).lines().collect()
        });

        if let Some(text) = input {
            // Errors from a child that exits early show up as a broken
            // pipe here; the exit status below is the authoritative
            // failure signal.
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(text.as_bytes());
            }
        }

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text);
        }
        let status = child.wait().map_err(|e| spawn_err(argv, &e))?;
        let lines = reader
            .join()
            .map_err(|_| Error::Internal("stdout reader thread panicked".into()))??;

        if !status.success() {
            return Err(Error::Process {
                cmd: argv.join(" "),
                detail: exit_detail(status.code(), &stderr_text),
            });
        }
        Ok(lines)
    }
}

fn split_argv<'a>(argv: &'a [&'a str]) -> Result<(&'a str, &'a [&'a str])> {
    argv.split_first()
        .map(|(cmd, args)| (*cmd, args))
        .ok_or_else(|| Error::Internal("empty command line".into()))
}

fn spawn_err(argv: &[&str], e: &std::io::Error) -> Error {
    Error::Process {
        cmd: argv.join(" "),
        detail: e.to_string(),
    }
}

fn exit_detail(code: Option<i32>, stderr: &str) -> String {
    let code = code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".into());
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exit status {}", code)
    } else {
        format!("exit status {}: {}", code, stderr)
    }
}

fn exec_capture(argv: &[&str]) -> Result<String> {
    let (cmd, args) = split_argv(argv)?;
    let out = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_err(argv, &e))?;
    if !out.status.success() {
        return Err(Error::Process {
            cmd: argv.join(" "),
            detail: exit_detail(out.status.code(), &String::from_utf8_lossy(&out.stderr)),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let runner = CmdRunner::new(false);
        let out = runner.run(&["echo", "hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_soft_maps_failure_to_none() {
        let runner = CmdRunner::new(false);
        assert!(runner.run_soft(&["false"]).unwrap().is_none());
        assert!(runner.run_soft(&["true"]).unwrap().is_some());
    }

    #[test]
    fn run_mutating_is_skipped_in_dry_run() {
        let runner = CmdRunner::new(true);
        // A command that would fail loudly if it actually ran.
        let out = runner
            .run_mutating(&["false", "--and-bogus-flag"])
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn stream_drains_output_while_writing_input() {
        let runner = CmdRunner::new(false);
        let big: String = "line\n".repeat(20000);
        let lines = runner.stream_lines(&["cat"], Some(&big)).unwrap();
        assert_eq!(lines.len(), 20000);
    }
}
