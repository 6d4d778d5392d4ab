//! Reusable collectors backing the catalog's checks.

use std::path::PathBuf;

use serde::Serialize;

use crate::collect;
use crate::settings::{Session, LOG_AGE_ALL};
use crate::tree::Collect;

fn drop_dir(session: &Session, subdir: &str) -> anyhow::Result<PathBuf> {
    let base = session
        .drop_directory()
        .ok_or_else(|| anyhow::anyhow!("no drop directory prepared"))?;
    Ok(if subdir.is_empty() {
        base
    } else {
        base.join(subdir)
    })
}

/// Writes a `metadata.json` describing the run itself.
pub struct Metadata;

#[derive(Serialize)]
struct RunMetadata {
    version: String,
    ticket: String,
    timestamp: String,
}

impl Collect for Metadata {
    fn run(&self, session: &Session) -> anyhow::Result<()> {
        let timestamp = session
            .state
            .borrow()
            .start_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let version = session
            .settings
            .get("version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = serde_json::to_string_pretty(&RunMetadata {
            version,
            ticket: session.settings.ticket(),
            timestamp,
        })?;
        let dst = drop_dir(session, "")?;
        if !collect::data_drop(session, &body, &dst, "metadata.json") {
            anyhow::bail!("could not write metadata.json");
        }
        Ok(())
    }
}

/// One command whose output is captured to a file.
pub struct CommandSpec {
    pub command: String,
    pub file: String,
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(command: &str, file: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            file: file.to_string(),
            timeout_secs,
        }
    }
}

/// Captures the output of a fixed list of commands into a subdirectory.
///
/// Missing executables or failing commands are logged and skipped; the
/// check as a whole still succeeds so one broken tool cannot shadow the
/// rest of the collection.
pub struct CommandDrops {
    pub subdir: String,
    pub commands: Vec<CommandSpec>,
}

impl Collect for CommandDrops {
    fn run(&self, session: &Session) -> anyhow::Result<()> {
        let dst = drop_dir(session, &self.subdir)?;
        for spec in &self.commands {
            collect::exec_drop(session, &spec.command, &dst, &spec.file, spec.timeout_secs);
        }
        Ok(())
    }
}

/// Copies a fixed list of files or directories into a subdirectory.
///
/// With `apply_log_age` the session's log_age filter limits copied files
/// by modification time.
pub struct FileDrops {
    pub subdir: String,
    pub paths: Vec<PathBuf>,
    pub apply_log_age: bool,
}

impl Collect for FileDrops {
    fn run(&self, session: &Session) -> anyhow::Result<()> {
        let dst = drop_dir(session, &self.subdir)?;
        let age = match (self.apply_log_age, session.settings.log_age()) {
            (false, _) | (true, LOG_AGE_ALL) => None,
            (true, days) => Some(days),
        };
        for path in &self.paths {
            collect::copy_drop(session, path, &dst, age);
        }
        Ok(())
    }
}

/// Collects systemd unit status and journal excerpts.
pub struct ServiceStatus {
    pub subdir: String,
    pub units: Vec<String>,
}

impl Collect for ServiceStatus {
    fn run(&self, session: &Session) -> anyhow::Result<()> {
        let dst = drop_dir(session, &self.subdir)?;
        collect::exec_drop(
            session,
            "systemctl list-units --all --no-pager",
            &dst,
            "systemctl_list_units.txt",
            60,
        );
        let since = match session.settings.log_age() {
            LOG_AGE_ALL => String::new(),
            days => format!(" --since '-{} days'", days),
        };
        for unit in &self.units {
            collect::exec_drop(
                session,
                &format!("systemctl status --no-pager --full {}", unit),
                &dst,
                &format!("systemctl_status_{}.txt", unit.replace('.', "_")),
                60,
            );
            collect::exec_drop(
                session,
                &format!("journalctl --no-pager --unit {}{}", unit, since),
                &dst,
                &format!("journalctl_{}.txt", unit.replace('.', "_")),
                120,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::StaticFacts;
    use crate::settings::Settings;
    use std::fs;

    fn session_with_drop_dir(dir: &std::path::Path) -> Session {
        let session = Session::new(Settings::default(), Box::new(StaticFacts::new()));
        session.state.borrow_mut().drop_directory = Some(dir.to_path_buf());
        session
    }

    #[test]
    fn metadata_lands_at_drop_root() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_drop_dir(dir.path());
        session.state.borrow_mut().start_time = Some(chrono::Local::now());

        Metadata.run(&session).unwrap();

        let body = fs::read_to_string(dir.path().join("metadata.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(parsed.get("timestamp").is_some());
    }

    #[test]
    fn command_drops_write_into_their_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_drop_dir(dir.path());
        let check = CommandDrops {
            subdir: "system".to_string(),
            commands: vec![CommandSpec::new("echo sample", "sample.txt", 5)],
        };

        check.run(&session).unwrap();

        let body = fs::read_to_string(dir.path().join("system/sample.txt")).unwrap();
        assert_eq!(body.trim(), "sample");
    }

    #[test]
    fn command_drops_survive_missing_tools() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_drop_dir(dir.path());
        let check = CommandDrops {
            subdir: "system".to_string(),
            commands: vec![CommandSpec::new("definitely-not-a-binary -x", "gone.txt", 5)],
        };
        assert!(check.run(&session).is_ok());
        assert!(!dir.path().join("system/gone.txt").exists());
    }

    #[test]
    fn file_drops_copy_under_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = tempfile::tempdir().unwrap();
        let src = src_root.path().join("app.conf");
        fs::write(&src, "x=1\n").unwrap();

        let session = session_with_drop_dir(dir.path());
        let check = FileDrops {
            subdir: "system/config".to_string(),
            paths: vec![src.clone()],
            apply_log_age: false,
        };
        check.run(&session).unwrap();

        let copied = dir
            .path()
            .join("system/config")
            .join(src.strip_prefix("/").unwrap());
        assert!(copied.is_file());
    }

    #[test]
    fn collectors_require_a_drop_directory() {
        let session = Session::new(Settings::default(), Box::new(StaticFacts::new()));
        assert!(Metadata.run(&session).is_err());
    }
}
