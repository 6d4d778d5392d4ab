//! Side-effect helpers used by concrete checks.
//!
//! Commands run through the shell with a best-effort wall-clock timeout;
//! a timed-out or unlaunchable command yields an empty result and a log
//! entry, never a process fault. Output lands in "drop" files under the
//! run's drop directory. All helpers honor noop mode by announcing what
//! they would do without touching the filesystem.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use walkdir::WalkDir;

use crate::settings::Session;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one shell invocation.
pub struct ExecOutput {
    pub stdout: String,
    pub status: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Prints a console progress line for the operator.
pub fn display(info: &str) {
    println!("{}", info);
}

/// Runs a command line through the shell, merging stderr into stdout.
///
/// `timeout_secs` of zero means no limit. The child is polled rather than
/// waited on so a hung command can be killed at the deadline. The shell
/// runs in its own process group: the actual command is a descendant of
/// the shell and holds the stdout pipe, so the whole group must die for
/// the deadline to be honored.
pub fn exec_capture(command_line: &str, timeout_secs: u64) -> std::io::Result<ExecOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(format!("({}) 2>&1", command_line))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stdout.read_to_end(&mut buffer);
            buffer
        })
    });
    let collect = |handle: Option<thread::JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };

    let deadline = (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ExecOutput {
                stdout: collect(reader),
                status: status.code(),
                timed_out: false,
            });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            // Killing only the shell leaves its descendants holding the
            // pipe open, which would block the reader join below.
            let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            let _ = child.wait();
            return Ok(ExecOutput {
                stdout: collect(reader),
                status: None,
                timed_out: true,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs a command and returns its output, or an empty string on failure
/// to launch or timeout.
pub fn exec_return_result(session: &Session, command_line: &str, timeout_secs: u64) -> String {
    match exec_capture(command_line, timeout_secs) {
        Ok(output) if output.timed_out => {
            session.log.error(|| {
                format!(
                    "exec_return_result: command timed out after {}s: {}",
                    timeout_secs, command_line
                )
            });
            String::new()
        }
        Ok(output) => output.stdout,
        Err(error) => {
            session.log.error(|| {
                format!(
                    "exec_return_result: command failed: {} with error: {}",
                    command_line, error
                )
            });
            String::new()
        }
    }
}

/// Runs a command and reports whether it exited zero.
pub fn exec_return_status(session: &Session, command_line: &str, timeout_secs: u64) -> bool {
    match exec_capture(command_line, timeout_secs) {
        Ok(output) => output.success(),
        Err(error) => {
            session.log.error(|| {
                format!(
                    "exec_return_status: command failed: {} with error: {}",
                    command_line, error
                )
            });
            false
        }
    }
}

/// Runs a command, failing on launch error, timeout, or non-zero exit.
pub fn exec_or_fail(command_line: &str, timeout_secs: u64) -> anyhow::Result<String> {
    let output = exec_capture(command_line, timeout_secs)?;
    if output.timed_out {
        anyhow::bail!("command timed out: {}", command_line);
    }
    if !output.success() {
        anyhow::bail!(
            "command failed: {} with status: {}",
            command_line,
            output.status.unwrap_or(-1)
        );
    }
    Ok(output.stdout)
}

/// Resolves an executable on PATH.
pub fn executable(command: &str) -> Option<PathBuf> {
    which::which(command).ok()
}

/// Appends the output of a command to a file under `dst`.
///
/// A missing executable is a logged no-op.
pub fn exec_drop(
    session: &Session,
    command_line: &str,
    dst: &Path,
    file: &str,
    timeout_secs: u64,
) -> bool {
    let command = command_line.split_whitespace().next().unwrap_or("");
    if executable(command).is_none() {
        session.log.debug(|| {
            format!(
                "exec_drop: command not found: {} cannot execute: {}",
                command, command_line
            )
        });
        return false;
    }

    let dst_file = dst.join(file);
    session.log.debug(|| {
        format!(
            "exec_drop: appending output of: {} to: {}",
            command_line,
            dst_file.display()
        )
    });

    if session.noop() {
        display(&format!(" (noop) Collecting output of: {}", command_line));
        return true;
    }
    display(&format!(" ** Collecting output of: {}", command_line));

    if !create_path(session, dst) {
        return false;
    }

    let output = match exec_capture(command_line, timeout_secs) {
        Ok(output) => output,
        Err(error) => {
            session.log.error(|| {
                format!(
                    "exec_drop: command failed: {} with error: {}",
                    command_line, error
                )
            });
            return false;
        }
    };
    if output.timed_out {
        session
            .log
            .error(|| format!("exec_drop: command timed out: {}", command_line));
        return false;
    }
    if append(&dst_file, &output.stdout).is_err() {
        session
            .log
            .error(|| format!("exec_drop: cannot write to: {}", dst_file.display()));
        return false;
    }
    output.success()
}

/// Appends data to a file under `dst`.
pub fn data_drop(session: &Session, data: &str, dst: &Path, file: &str) -> bool {
    let dst_file = dst.join(file);
    session
        .log
        .debug(|| format!("data_drop: appending to: {}", dst_file.display()));

    if session.noop() {
        display(&format!(" (noop) Adding data to: {}", dst_file.display()));
        return true;
    }
    display(&format!(" ** Adding data to: {}", dst_file.display()));

    if !create_path(session, dst) {
        return false;
    }
    if append(&dst_file, data).is_err() {
        session
            .log
            .error(|| format!("data_drop: cannot write to: {}", dst_file.display()));
        return false;
    }
    true
}

/// Copies a file or directory under `dst`, re-creating the source's parent
/// path and optionally filtering files by mtime age in days.
///
/// An unreadable source is a logged no-op.
pub fn copy_drop(session: &Session, src: &Path, dst: &Path, age_days: Option<u64>) -> bool {
    session.log.debug(|| {
        format!(
            "copy_drop: copying: {} to: {} with age: {:?}",
            src.display(),
            dst.display(),
            age_days
        )
    });

    let metadata = match fs::metadata(src) {
        Ok(metadata) => metadata,
        Err(_) => {
            session
                .log
                .debug(|| format!("copy_drop: source not readable: {}", src.display()));
            return false;
        }
    };

    if session.noop() {
        display(&format!(" (noop) Copying: {}", src.display()));
        return true;
    }
    display(&format!(" ** Copying: {}", src.display()));

    if metadata.is_dir() {
        let mut ok = true;
        for entry in WalkDir::new(src).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    session
                        .log
                        .debug(|| format!("copy_drop: skipping entry: {}", error));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !within_age(entry.path(), age_days) {
                continue;
            }
            if !copy_one(session, entry.path(), dst) {
                ok = false;
            }
        }
        ok
    } else {
        if !within_age(src, age_days) {
            return true;
        }
        copy_one(session, src, dst)
    }
}

fn copy_one(session: &Session, src: &Path, dst: &Path) -> bool {
    let relative = src.strip_prefix("/").unwrap_or(src);
    let target = dst.join(relative);
    if let Some(parent) = target.parent() {
        if fs::create_dir_all(parent).is_err() {
            session
                .log
                .error(|| format!("copy_drop: cannot create: {}", parent.display()));
            return false;
        }
    }
    match fs::copy(src, &target) {
        Ok(_) => true,
        Err(error) => {
            session.log.error(|| {
                format!(
                    "copy_drop: cannot copy: {} to: {}: {}",
                    src.display(),
                    target.display(),
                    error
                )
            });
            false
        }
    }
}

fn within_age(path: &Path, age_days: Option<u64>) -> bool {
    let Some(days) = age_days else {
        return true;
    };
    let modified = fs::metadata(path).and_then(|m| m.modified());
    match modified.and_then(|m| {
        m.elapsed()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }) {
        Ok(elapsed) => elapsed <= Duration::from_secs(days.saturating_mul(86_400)),
        // Unreadable or future mtimes are not grounds to skip a file.
        Err(_) => true,
    }
}

/// Recursively creates a directory, logging failure.
pub fn create_path(session: &Session, path: &Path) -> bool {
    if session.noop() {
        return true;
    }
    match fs::create_dir_all(path) {
        Ok(()) => true,
        Err(error) => {
            session.log.error(|| {
                format!(
                    "create_path: cannot create directory {}: {}",
                    path.display(),
                    error
                )
            });
            false
        }
    }
}

fn append(path: &Path, data: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data.as_bytes())?;
    if !data.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::StaticFacts;
    use crate::settings::Settings;
    use serde_json::json;

    fn session() -> Session {
        Session::new(Settings::default(), Box::new(StaticFacts::new()))
    }

    fn noop_session() -> Session {
        let mut settings = Settings::default();
        settings
            .configure(&[("noop".to_string(), json!(true))])
            .unwrap();
        Session::new(settings, Box::new(StaticFacts::new()))
    }

    #[test]
    fn exec_capture_reports_exit_status() {
        let ok = exec_capture("true", 0).unwrap();
        assert!(ok.success());

        let fail = exec_capture("false", 0).unwrap();
        assert!(!fail.success());
        assert_eq!(fail.status, Some(1));
    }

    #[test]
    fn exec_capture_merges_stderr() {
        let out = exec_capture("echo visible 1>&2", 0).unwrap();
        assert_eq!(out.stdout.trim(), "visible");
    }

    #[test]
    fn exec_capture_times_out_hung_commands() {
        let start = Instant::now();
        let out = exec_capture("sleep 30", 1).unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_covers_descendants_holding_the_output_pipe() {
        // The command the shell runs keeps stdout open past the deadline;
        // returning promptly requires killing the whole process group.
        let start = Instant::now();
        let out = exec_capture("sleep 8", 1).unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_keeps_output_written_before_the_deadline() {
        let out = exec_capture("echo early; sleep 8", 1).unwrap();
        assert!(out.timed_out);
        assert_eq!(out.stdout.trim(), "early");
    }

    #[test]
    fn exec_return_result_is_empty_on_timeout() {
        let s = session();
        assert_eq!(exec_return_result(&s, "sleep 30", 1), "");
    }

    #[test]
    fn data_drop_appends_with_newline() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        assert!(data_drop(&s, "first", dir.path(), "out.txt"));
        assert!(data_drop(&s, "second", dir.path(), "out.txt"));
        let body = fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(body, "first\nsecond\n");
    }

    #[test]
    fn exec_drop_skips_missing_executables() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        assert!(!exec_drop(
            &s,
            "no-such-binary-here --version",
            dir.path(),
            "out.txt",
            5
        ));
        assert!(!dir.path().join("out.txt").exists());
    }

    #[test]
    fn exec_drop_collects_command_output() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        assert!(exec_drop(&s, "echo hello", dir.path(), "hello.txt", 5));
        let body = fs::read_to_string(dir.path().join("hello.txt")).unwrap();
        assert_eq!(body.trim(), "hello");
    }

    #[test]
    fn copy_drop_recreates_parent_paths() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        let src_root = tempfile::tempdir().unwrap();
        let src = src_root.path().join("etc/app/app.conf");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, "setting = 1\n").unwrap();

        assert!(copy_drop(&s, &src, dir.path(), None));

        let copied = dir.path().join(src.strip_prefix("/").unwrap());
        assert!(copied.is_file());
    }

    #[test]
    fn copy_drop_handles_missing_source_quietly() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        assert!(!copy_drop(&s, Path::new("/nonexistent/nope"), dir.path(), None));
    }

    #[test]
    fn noop_mode_touches_nothing() {
        let s = noop_session();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never");
        assert!(data_drop(&s, "data", &out, "file.txt"));
        assert!(exec_drop(&s, "echo hi", &out, "file.txt", 5));
        assert!(!out.exists());
    }
}
