//! Packaging of the drop directory: tarball, optional GPG encryption,
//! optional SFTP upload.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::collect::{self, display};
use crate::settings::Session;

/// Tars and gzips the drop directory next to it, owner-readable only.
///
/// Returns the archive path. In noop mode nothing is written.
pub fn create_archive(session: &Session) -> anyhow::Result<PathBuf> {
    let drop_dir = session
        .drop_directory()
        .ok_or_else(|| anyhow::anyhow!("no drop directory to archive"))?;
    let parent = drop_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("drop directory has no parent"))?;
    let name = drop_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("drop directory has no name"))?;
    let archive_path = parent.join(format!("{}.tar.gz", name));

    if session.noop() {
        display(&format!(
            " (noop) Creating archive: {}",
            archive_path.display()
        ));
        return Ok(archive_path);
    }
    display(&format!(" ** Creating archive: {}", archive_path.display()));

    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(&archive_path)
        .with_context(|| format!("cannot create archive: {}", archive_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(name, &drop_dir)
        .with_context(|| format!("cannot archive: {}", drop_dir.display()))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .context("cannot finish archive")?;

    Ok(archive_path)
}

/// Encrypts the archive with GPG to the configured recipient, then
/// removes the plaintext archive.
///
/// A throwaway GPG home inside the drop directory keeps the operator's
/// keyring untouched.
pub fn encrypt_archive(session: &Session, archive: &Path) -> anyhow::Result<PathBuf> {
    let encrypted = archive.with_extension("gz.gpg");
    if session.noop() {
        display(&format!(
            " (noop) Encrypting archive to: {}",
            encrypted.display()
        ));
        return Ok(encrypted);
    }

    let gpg = session
        .state
        .borrow()
        .gpg_command
        .clone()
        .ok_or_else(|| anyhow::anyhow!("gpg is not available"))?;
    let drop_dir = session
        .drop_directory()
        .ok_or_else(|| anyhow::anyhow!("no drop directory for gpg home"))?;
    let gpg_home = drop_dir.join("gpg");
    fs::DirBuilder::new()
        .mode(0o700)
        .create(&gpg_home)
        .with_context(|| format!("cannot create gpg home: {}", gpg_home.display()))?;

    display(&format!(
        " ** Encrypting archive to: {}",
        encrypted.display()
    ));
    let command = format!(
        "{} --batch --no-tty --homedir '{}' --trust-model always --recipient '{}' \
         --output '{}' --encrypt '{}'",
        gpg.display(),
        gpg_home.display(),
        session.settings.encrypt_recipient(),
        encrypted.display(),
        archive.display()
    );
    collect::exec_or_fail(&command, 600).context("gpg encryption failed")?;

    fs::remove_file(archive)
        .with_context(|| format!("cannot remove plaintext archive: {}", archive.display()))?;
    Ok(encrypted)
}

/// Uploads the archive over SFTP and deletes the local copy on success.
///
/// On failure the archive is kept and manual upload instructions are
/// printed; the upload is not an error for the run as a whole.
pub fn upload_archive(session: &Session, archive: &Path) -> bool {
    if session.noop() {
        display(&format!(" (noop) Uploading: {}", archive.display()));
        return true;
    }
    let Some(sftp) = session.state.borrow().sftp_command.clone() else {
        session.log.error(|| "sftp is not available".to_string());
        display_summary(session, archive);
        return false;
    };

    let user = session
        .settings
        .upload_user()
        .unwrap_or_else(|| session.settings.ticket());
    let mut options = String::new();
    if let Some(key) = session.settings.upload_key() {
        options.push_str(&format!(" -i '{}'", key.display()));
    }
    if session.settings.upload_disable_host_key_check() {
        options.push_str(" -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null");
    }

    display(&format!(" ** Uploading: {}", archive.display()));
    let command = format!(
        "echo 'put {}' | {}{} -b - {}@customer-support.example.com",
        archive.display(),
        sftp.display(),
        options,
        user
    );
    match collect::exec_or_fail(&command, 3600) {
        Ok(_) => {
            if let Err(error) = fs::remove_file(archive) {
                session.log.error(|| {
                    format!(
                        "cannot remove uploaded archive {}: {}",
                        archive.display(),
                        error
                    )
                });
            }
            display(" ** Upload complete");
            true
        }
        Err(error) => {
            session
                .log
                .error(|| format!("upload failed: {:#}", error));
            display_summary(session, archive);
            false
        }
    }
}

/// Tells the operator where the output is and what to do with it.
pub fn display_summary(session: &Session, archive: &Path) {
    display("");
    display(&format!("Support data is located at: {}", archive.display()));
    if !session.settings.ticket().is_empty() {
        display(&format!(
            "Attach it to ticket {} or provide it to your support contact.",
            session.settings.ticket()
        ));
    } else {
        display("Provide it to your support contact.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::StaticFacts;
    use crate::settings::Settings;
    use flate2::read::GzDecoder;
    use serde_json::json;

    fn session_with_drop_dir(dir: &Path) -> Session {
        let session = Session::new(Settings::default(), Box::new(StaticFacts::new()));
        session.state.borrow_mut().drop_directory = Some(dir.to_path_buf());
        session
    }

    #[test]
    fn create_archive_packs_the_drop_directory() {
        let base = tempfile::tempdir().unwrap();
        let drop_dir = base.path().join("bosun_support_host_20260101000000");
        fs::create_dir(&drop_dir).unwrap();
        fs::write(drop_dir.join("metadata.json"), "{}\n").unwrap();

        let session = session_with_drop_dir(&drop_dir);
        let archive = create_archive(&session).unwrap();
        assert!(archive.is_file());
        assert!(archive
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".tar.gz"));

        let mut entries = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let names: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names
            .iter()
            .any(|n| n.ends_with("metadata.json")), "{:?}", names);
    }

    #[test]
    fn create_archive_refuses_to_overwrite() {
        let base = tempfile::tempdir().unwrap();
        let drop_dir = base.path().join("bosun_support_host_20260101000000");
        fs::create_dir(&drop_dir).unwrap();
        fs::write(base.path().join("bosun_support_host_20260101000000.tar.gz"), "").unwrap();

        let session = session_with_drop_dir(&drop_dir);
        assert!(create_archive(&session).is_err());
    }

    #[test]
    fn noop_archive_writes_nothing() {
        let base = tempfile::tempdir().unwrap();
        let drop_dir = base.path().join("bosun_support_host_20260101000000");
        fs::create_dir(&drop_dir).unwrap();

        let mut settings = Settings::default();
        settings
            .configure(&[("noop".to_string(), json!(true))])
            .unwrap();
        let session = Session::new(settings, Box::new(StaticFacts::new()));
        session.state.borrow_mut().drop_directory = Some(drop_dir);

        let archive = create_archive(&session).unwrap();
        assert!(!archive.exists());
    }

    #[test]
    fn encrypt_requires_gpg() {
        let base = tempfile::tempdir().unwrap();
        let drop_dir = base.path().join("d");
        fs::create_dir(&drop_dir).unwrap();
        let session = session_with_drop_dir(&drop_dir);
        let archive = base.path().join("d.tar.gz");
        assert!(encrypt_archive(&session, &archive).is_err());
    }
}
