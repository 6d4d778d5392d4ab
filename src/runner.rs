//! Top-level orchestration of one support run.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use chrono::Local;
use serde_json::Value;

use crate::archive;
use crate::collect::{self, display};
use crate::logging::{FileSink, LogSink};
use crate::settings::Session;
use crate::tree::{ScopeDef, ScopeNode};

pub const LOG_FILE_NAME: &str = "bosun_log.jsonl";

pub struct Runner {
    session: Session,
    root: ScopeDef,
}

impl Runner {
    pub fn new(session: Session, root: ScopeDef) -> Self {
        Self { session, root }
    }

    /// Verifies the host and settings before anything touches the disk.
    fn setup(&self) -> bool {
        let session = &self.session;

        let kernel = session.facts.value("kernel");
        let is_linux = matches!(&kernel, Some(Value::String(k)) if k.contains("linux"));
        if !is_linux {
            session
                .log
                .fatal(|| format!("this tool only supports Linux, got kernel: {:?}", kernel));
            return false;
        }

        let privileged = matches!(
            session.facts.value("identity.privileged"),
            Some(Value::Bool(true))
        );
        if !privileged {
            session
                .log
                .fatal(|| "this tool must be run with root privileges".to_string());
            return false;
        }

        if let Err(error) = session.settings.validate() {
            session.log.fatal(|| format!("invalid settings: {}", error));
            return false;
        }

        if session.settings.encrypt() {
            match collect::executable("gpg") {
                Some(path) => session.state.borrow_mut().gpg_command = Some(path),
                None => {
                    session
                        .log
                        .fatal(|| "encryption requested but gpg is not on PATH".to_string());
                    return false;
                }
            }
        }
        if session.settings.upload() {
            match collect::executable("sftp") {
                Some(path) => session.state.borrow_mut().sftp_command = Some(path),
                None => {
                    session
                        .log
                        .fatal(|| "upload requested but sftp is not on PATH".to_string());
                    return false;
                }
            }
        }

        session.state.borrow_mut().start_time = Some(Local::now());
        true
    }

    /// Computes and, outside noop, creates the drop directory.
    fn setup_drop_directory(&self) -> anyhow::Result<PathBuf> {
        let session = &self.session;
        let base = session.settings.dir();
        let base = fs::canonicalize(&base)
            .with_context(|| format!("cannot resolve output directory: {}", base.display()))?;

        let hostname = match session.facts.value("hostname") {
            Some(Value::String(name)) => name,
            _ => "unknown".to_string(),
        };
        let short_hostname = hostname.split('.').next().unwrap_or("unknown").to_string();
        let timestamp = session
            .state
            .borrow()
            .start_time
            .ok_or_else(|| anyhow::anyhow!("run has no start time"))?
            .format("%Y%m%d%H%M%S")
            .to_string();

        let mut parts = vec!["bosun_support".to_string()];
        let ticket = session.settings.ticket();
        if !ticket.is_empty() {
            parts.push(ticket);
        }
        parts.push(short_hostname);
        parts.push(timestamp);
        let drop_dir = base.join(parts.join("_"));

        if session.noop() {
            display(&format!(
                " (noop) Creating drop directory: {}",
                drop_dir.display()
            ));
        } else {
            fs::DirBuilder::new()
                .mode(0o700)
                .create(&drop_dir)
                .with_context(|| {
                    format!("cannot create drop directory: {}", drop_dir.display())
                })?;
        }
        session.state.borrow_mut().drop_directory = Some(drop_dir.clone());
        Ok(drop_dir)
    }

    fn finalize(&self) -> anyhow::Result<()> {
        let session = &self.session;
        let mut archive_path = archive::create_archive(session)?;
        if session.settings.encrypt() {
            archive_path = archive::encrypt_archive(session, &archive_path)?;
        }
        if session.settings.upload() {
            archive::upload_archive(session, &archive_path);
        } else {
            archive::display_summary(session, &archive_path);
        }
        Ok(())
    }

    fn cleanup(&self, drop_dir: &Path) {
        let session = &self.session;
        if session.noop() || session.settings.keep_drop_directory() {
            return;
        }
        if let Err(error) = fs::remove_dir_all(drop_dir) {
            session.log.error(|| {
                format!(
                    "cannot remove drop directory {}: {}",
                    drop_dir.display(),
                    error
                )
            });
        }
    }

    /// Runs the whole collection and returns the process exit code.
    pub fn run(&self) -> i32 {
        let session = &self.session;
        if !self.setup() {
            return 1;
        }

        let root = match self.root.instantiate(session) {
            Ok(root) => root,
            Err(error) => {
                session
                    .log
                    .fatal(|| format!("could not build the check tree: {:#}", error));
                return 1;
            }
        };

        if session.settings.list() {
            root.describe(session);
            return session.state.borrow().exit_code;
        }

        let drop_dir = match self.setup_drop_directory() {
            Ok(dir) => dir,
            Err(error) => {
                session.log.fatal(|| format!("{:#}", error));
                return 1;
            }
        };

        self.execute(&root, &drop_dir)
    }

    /// Everything after the drop directory exists; the directory is
    /// removed on every exit path unless the operator keeps it.
    fn execute(&self, root: &ScopeNode, drop_dir: &Path) -> i32 {
        let code = self.collect_and_package(root, drop_dir);
        self.cleanup(drop_dir);
        code
    }

    fn collect_and_package(&self, root: &ScopeNode, drop_dir: &Path) -> i32 {
        let session = &self.session;
        let file_sink: Option<Rc<dyn LogSink>> = if session.noop() {
            None
        } else {
            match FileSink::create(&drop_dir.join(LOG_FILE_NAME)) {
                Ok(sink) => Some(Rc::new(sink)),
                Err(error) => {
                    session
                        .log
                        .fatal(|| format!("cannot open the run log: {}", error));
                    return 1;
                }
            }
        };
        if let Some(sink) = &file_sink {
            session.log.add_sink(Rc::clone(sink));
        }

        root.run(session);

        if let Some(sink) = &file_sink {
            session.log.remove_sink(sink);
        }

        if let Err(error) = self.finalize() {
            session.record_failure();
            session
                .log
                .error(|| format!("could not package the results: {:#}", error));
        }
        session.state.borrow().exit_code
    }
}
