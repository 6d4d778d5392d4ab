//! Shared configuration and run state.
//!
//! [`Settings`] holds the validated user options for a run; [`RunState`]
//! holds transient state written while the run executes (exit code, drop
//! directory, resolved tool paths, caches). Both live inside a [`Session`]
//! built once at process start and passed by reference to the runner and
//! the node tree.
//!
//! Options only change through [`Settings::configure`], which validates
//! every pair before applying any of them: a bad key leaves the store
//! untouched.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde_json::Value;
use thiserror::Error;

use crate::facts::Facts;
use crate::logging::LogManager;

/// The unbounded sentinel: `--log-age all` collects logs of any age.
pub const LOG_AGE_ALL: u64 = 999;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("the {key} option must be set to {expected}; got {got}")]
    InvalidOption {
        key: String,
        expected: String,
        got: String,
    },
    #[error("the dir option cannot be a symlink: {0}")]
    DirIsSymlink(PathBuf),
    #[error("the dir option is not set to a writable directory: {0}")]
    DirNotWritable(PathBuf),
    #[error("the upload option requires a value for the ticket option")]
    UploadWithoutTicket,
    #[error("the upload_key option is not readable or does not exist: {0}")]
    UploadKeyUnreadable(PathBuf),
    #[error("the encrypt option requires a value for the encrypt_recipient option")]
    EncryptWithoutRecipient,
}

/// Validated option store.
///
/// Keys with validators are normalized on the way in; unknown keys pass
/// through unchanged so collaborators can stash their own options.
#[derive(Debug, Clone)]
pub struct Settings {
    options: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let default_dir = if PathBuf::from("/var/tmp").is_dir() {
            "/var/tmp"
        } else {
            "/tmp"
        };
        let mut options = BTreeMap::new();
        options.insert("dir".to_string(), Value::from(default_dir));
        options.insert("log_age".to_string(), Value::from(14u64));
        options.insert("noop".to_string(), Value::from(false));
        options.insert("encrypt".to_string(), Value::from(false));
        options.insert("encrypt_recipient".to_string(), Value::from(""));
        options.insert("ticket".to_string(), Value::from(""));
        options.insert("upload".to_string(), Value::from(false));
        options.insert(
            "upload_disable_host_key_check".to_string(),
            Value::from(false),
        );
        options.insert("keep_drop_directory".to_string(), Value::from(false));
        options.insert("list".to_string(), Value::from(false));
        options.insert("enable".to_string(), Value::Array(Vec::new()));
        options.insert("disable".to_string(), Value::Array(Vec::new()));
        options.insert("only".to_string(), Value::Array(Vec::new()));
        options.insert(
            "version".to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        );
        Self { options }
    }
}

impl Settings {
    /// Merges validated key/value pairs into the store.
    ///
    /// Atomic: every pair is validated first, and the first invalid value
    /// fails the whole call with nothing applied.
    pub fn configure(&mut self, options: &[(String, Value)]) -> Result<(), SettingsError> {
        let mut staged = Vec::with_capacity(options.len());
        for (key, value) in options {
            staged.push((key.clone(), validate_option(key, value)?));
        }
        for (key, value) in staged {
            self.options.insert(key, value);
        }
        Ok(())
    }

    /// Cross-key checks undetectable from a single option, run once before
    /// the tree walk.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let dir = self.dir();
        let is_symlink = fs::symlink_metadata(&dir)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            return Err(SettingsError::DirIsSymlink(dir));
        }
        if !dir.is_dir() || !writable(&dir) {
            return Err(SettingsError::DirNotWritable(dir));
        }

        if self.upload() && self.ticket().is_empty() {
            return Err(SettingsError::UploadWithoutTicket);
        }
        if self.upload() {
            if let Some(key) = self.upload_key() {
                if fs::File::open(&key).is_err() {
                    return Err(SettingsError::UploadKeyUnreadable(key));
                }
            }
        }
        if self.encrypt() && self.encrypt_recipient().is_empty() {
            return Err(SettingsError::EncryptWithoutRecipient);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn dir(&self) -> PathBuf {
        PathBuf::from(self.str_option("dir"))
    }

    pub fn log_age(&self) -> u64 {
        self.options
            .get("log_age")
            .and_then(Value::as_u64)
            .unwrap_or(14)
    }

    pub fn ticket(&self) -> String {
        self.str_option("ticket")
    }

    pub fn encrypt_recipient(&self) -> String {
        self.str_option("encrypt_recipient")
    }

    pub fn upload_user(&self) -> Option<String> {
        self.options
            .get("upload_user")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn upload_key(&self) -> Option<PathBuf> {
        self.options
            .get("upload_key")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn noop(&self) -> bool {
        self.bool_option("noop")
    }

    pub fn encrypt(&self) -> bool {
        self.bool_option("encrypt")
    }

    pub fn upload(&self) -> bool {
        self.bool_option("upload")
    }

    pub fn upload_disable_host_key_check(&self) -> bool {
        self.bool_option("upload_disable_host_key_check")
    }

    pub fn keep_drop_directory(&self) -> bool {
        self.bool_option("keep_drop_directory")
    }

    pub fn list(&self) -> bool {
        self.bool_option("list")
    }

    pub fn enable(&self) -> Vec<String> {
        self.list_option("enable")
    }

    pub fn disable(&self) -> Vec<String> {
        self.list_option("disable")
    }

    pub fn only(&self) -> Vec<String> {
        self.list_option("only")
    }

    fn bool_option(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn str_option(&self, key: &str) -> String {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    fn list_option(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn validate_option(key: &str, value: &Value) -> Result<Value, SettingsError> {
    match key {
        "enable" | "disable" | "only" => {
            let ok = value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            if !ok {
                return Err(invalid(key, "a sequence of strings", value));
            }
            Ok(value.clone())
        }
        "noop" | "encrypt" | "upload" | "upload_disable_host_key_check" | "list"
        | "keep_drop_directory" => {
            if !value.is_boolean() {
                return Err(invalid(key, "true or false", value));
            }
            Ok(value.clone())
        }
        "log_age" => parse_log_age(value),
        "ticket" => {
            let ok = value
                .as_str()
                .map(|s| {
                    !s.is_empty()
                        && s.chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                })
                .unwrap_or(false);
            if !ok {
                return Err(invalid(
                    key,
                    "only numbers, letters, underscores, and dashes",
                    value,
                ));
            }
            Ok(value.clone())
        }
        "dir" | "encrypt_recipient" | "upload_key" | "upload_user" => {
            if !value.is_string() {
                return Err(invalid(key, "a string", value));
            }
            Ok(value.clone())
        }
        // Unknown-but-accepted keys pass through unchanged.
        _ => Ok(value.clone()),
    }
}

fn parse_log_age(value: &Value) -> Result<Value, SettingsError> {
    if let Some(n) = value.as_u64() {
        return Ok(Value::from(n));
    }
    if let Some(s) = value.as_str() {
        if s == "all" {
            return Ok(Value::from(LOG_AGE_ALL));
        }
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = s.parse::<u64>() {
                return Ok(Value::from(n));
            }
        }
    }
    Err(invalid("log_age", "a number, or the string \"all\"", value))
}

fn invalid(key: &str, expected: &str, value: &Value) -> SettingsError {
    let got = match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "a boolean".to_string(),
        Value::Number(_) => "a number".to_string(),
        Value::String(s) => format!("\"{}\"", s),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
    };
    SettingsError::InvalidOption {
        key: key.to_string(),
        expected: expected.to_string(),
        got,
    }
}

fn writable(path: &std::path::Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

/// Transient state accumulated while a run executes.
#[derive(Debug, Default)]
pub struct RunState {
    pub exit_code: i32,
    pub drop_directory: Option<PathBuf>,
    pub start_time: Option<DateTime<Local>>,
    pub gpg_command: Option<PathBuf>,
    pub sftp_command: Option<PathBuf>,
    pub caches: HashMap<String, Value>,
}

/// Everything a node or helper needs for one run.
///
/// Built once in `main` and shared by reference; run state uses a
/// `RefCell` because the walk is strictly single threaded.
pub struct Session {
    pub settings: Settings,
    pub state: RefCell<RunState>,
    pub log: LogManager,
    pub facts: Box<dyn Facts>,
}

impl Session {
    pub fn new(settings: Settings, facts: Box<dyn Facts>) -> Self {
        Self {
            settings,
            state: RefCell::new(RunState::default()),
            log: LogManager::new(),
            facts,
        }
    }

    pub fn noop(&self) -> bool {
        self.settings.noop()
    }

    pub fn drop_directory(&self) -> Option<PathBuf> {
        self.state.borrow().drop_directory.clone()
    }

    pub fn record_failure(&self) {
        self.state.borrow_mut().exit_code = 1;
    }
}
