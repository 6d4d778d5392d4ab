use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(
    name = "bosun",
    version,
    about = "Collects system diagnostics into a support bundle"
)]
pub struct Cli {
    #[arg(long, help = "Output directory for the support bundle")]
    pub dir: Option<String>,
    #[arg(long, help = "Support ticket number to tag the bundle with")]
    pub ticket: Option<String>,
    #[arg(
        long,
        help = "Collect logs modified within this many days, or 'all'",
        value_name = "DAYS"
    )]
    pub log_age: Option<String>,
    #[arg(long, value_delimiter = ',', help = "Run only these checks or scopes")]
    pub only: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Also run these opt-in checks")]
    pub enable: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Never run these checks or scopes")]
    pub disable: Vec<String>,
    #[arg(long, help = "List available checks instead of running them")]
    pub list: bool,
    #[arg(long, help = "Show what would be collected without touching the system")]
    pub noop: bool,
    #[arg(long, help = "Encrypt the bundle with GPG")]
    pub encrypt: bool,
    #[arg(long, requires = "encrypt", help = "GPG recipient for --encrypt")]
    pub encrypt_recipient: Option<String>,
    #[arg(long, help = "Upload the bundle over SFTP")]
    pub upload: bool,
    #[arg(long, help = "SFTP username, defaults to the ticket number")]
    pub upload_user: Option<String>,
    #[arg(long, help = "Private key for the SFTP upload")]
    pub upload_key: Option<String>,
    #[arg(long, help = "Skip SFTP host key verification")]
    pub upload_disable_host_key_check: bool,
    #[arg(long, help = "Keep the unpacked drop directory after archiving")]
    pub keep_drop_directory: bool,
    #[arg(long, help = "Log debug detail to the console")]
    pub debug: bool,
}

impl Cli {
    /// Flattens the parsed arguments into settings pairs, skipping
    /// anything the user did not pass.
    pub fn to_options(&self) -> Vec<(String, Value)> {
        let mut options = Vec::new();
        let mut push = |key: &str, value: Value| options.push((key.to_string(), value));

        if let Some(dir) = &self.dir {
            push("dir", json!(dir));
        }
        if let Some(ticket) = &self.ticket {
            push("ticket", json!(ticket));
        }
        if let Some(log_age) = &self.log_age {
            push("log_age", json!(log_age));
        }
        if !self.only.is_empty() {
            push("only", json!(self.only));
        }
        if !self.enable.is_empty() {
            push("enable", json!(self.enable));
        }
        if !self.disable.is_empty() {
            push("disable", json!(self.disable));
        }
        if self.list {
            push("list", json!(true));
        }
        if self.noop {
            push("noop", json!(true));
        }
        if self.encrypt {
            push("encrypt", json!(true));
        }
        if let Some(recipient) = &self.encrypt_recipient {
            push("encrypt_recipient", json!(recipient));
        }
        if self.upload {
            push("upload", json!(true));
        }
        if let Some(user) = &self.upload_user {
            push("upload_user", json!(user));
        }
        if let Some(key) = &self.upload_key {
            push("upload_key", json!(key));
        }
        if self.upload_disable_host_key_check {
            push("upload_disable_host_key_check", json!(true));
        }
        if self.keep_drop_directory {
            push("keep_drop_directory", json!(true));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_no_overrides() {
        let cli = Cli::parse_from(["bosun"]);
        assert!(cli.to_options().is_empty());
    }

    #[test]
    fn list_flags_split_on_commas() {
        let cli = Cli::parse_from(["bosun", "--only", "system,services.status"]);
        let options = cli.to_options();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].0, "only");
        assert_eq!(options[0].1, json!(["system", "services.status"]));
    }

    #[test]
    fn encrypt_recipient_requires_encrypt() {
        assert!(Cli::try_parse_from(["bosun", "--encrypt-recipient", "support@example.com"])
            .is_err());
        assert!(Cli::try_parse_from([
            "bosun",
            "--encrypt",
            "--encrypt-recipient",
            "support@example.com"
        ])
        .is_ok());
    }
}
