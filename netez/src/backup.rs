//! Configuration backups on the device's file store.
//!
//! Backups are created with a console command and transferred over SFTP on
//! the same session. The device writes the file asynchronously, so
//! [`BackupGateway::create`] only returns once the file is listed.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use tempfile::NamedTempFile;

use crate::driver::{Command, Executor, Value};
use crate::error::{Error, Result, ValidationError};
use crate::transport::Transport;

/// Extension the device gives backup files.
pub const BACKUP_EXTENSION: &str = ".backup";

const MAX_NAME: usize = 64;

/// Validate a backup name, dropping a trailing `.backup`.
pub fn backup_name(name: &str) -> std::result::Result<String, ValidationError> {
    let base = name.trim();
    let base = base.strip_suffix(BACKUP_EXTENSION).unwrap_or(base);
    check_file_name(base)?;
    Ok(base.to_string())
}

fn check_file_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty {
            field: "backup name",
        });
    }
    if name.len() > MAX_NAME {
        return Err(ValidationError::Length {
            field: "backup name",
            min: 1,
            max: MAX_NAME,
        });
    }
    let allowed = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !allowed || name.starts_with('.') {
        return Err(ValidationError::IllegalCharacters {
            field: "backup name",
            value: name.to_string(),
        });
    }
    Ok(())
}

/// Lists, creates and transfers backups.
pub struct BackupGateway<'a, T> {
    exec: Executor<'a, T>,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl<'a, T: Transport> BackupGateway<'a, T> {
    pub fn new(exec: Executor<'a, T>) -> Self {
        Self {
            exec,
            poll_attempts: 10,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Bound the wait for a new backup to show up.
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    /// Backup file names in the root of the file store, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut files: Vec<String> = self
            .exec
            .list_dir("/")
            .await?
            .into_iter()
            .filter(|f| f.ends_with(BACKUP_EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Save a backup and wait until its file is listed. Returns the file
    /// name (`<name>.backup`).
    ///
    /// Saving under an existing name overwrites that file, so an existing
    /// file only counts once its size or modification time has changed.
    pub async fn create(&self, name: &str) -> Result<String> {
        let base = backup_name(name)?;
        let file = format!("{base}{BACKUP_EXTENSION}");
        let path = format!("/{file}");

        let command = Command::builder("/system backup", "save")
            .arg("name", &Value::text("backup name", &base, 1, MAX_NAME)?)
            .build();
        let previous = self.exec.stat(&path).await?;
        if previous.is_some() {
            debug!("{file} exists, waiting for it to be rewritten");
        }
        self.exec.execute(&command).await?;

        for attempt in 1..=self.poll_attempts {
            if self.list().await?.contains(&file) {
                let current = self.exec.stat(&path).await?;
                if current.is_some() && current != previous {
                    info!("backup {file} created");
                    return Ok(file);
                }
            }
            debug!(
                "backup {file} not written yet ({attempt}/{})",
                self.poll_attempts
            );
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(Error::BackupTimeout {
            name: file,
            attempts: self.poll_attempts,
        })
    }

    /// Fetch a backup into memory.
    pub async fn fetch(&self, name: &str) -> Result<Bytes> {
        check_file_name(name.trim())?;
        let path = format!("/{}", name.trim());
        let data = self.exec.read_file(&path).await?;
        if data.is_empty() {
            return Err(Error::EmptyTransfer { path });
        }
        debug!("fetched {path}: {} bytes", data.len());
        Ok(data)
    }

    /// Fetch a backup into `dir`. The file appears under its final name
    /// only once complete; on failure nothing is left in `dir`.
    pub async fn fetch_to(&self, name: &str, dir: &Path) -> Result<PathBuf> {
        let data = self.fetch(name).await?;
        save_to(name, dir, data).await
    }
}

/// Write fetched backup bytes into `dir` under `name`, through a temp file
/// persisted in place. Runs on the blocking pool.
pub async fn save_to(name: &str, dir: &Path, data: Bytes) -> Result<PathBuf> {
    let name = name.trim().to_string();
    check_file_name(&name)?;
    let dir = dir.to_path_buf();
    let target = dir.join(&name);

    let written = target.clone();
    let outcome =
        tokio::task::spawn_blocking(move || write_atomically(&dir, &written, &data)).await;
    let io_error = |source| Error::Io {
        path: target.display().to_string(),
        source,
    };
    match outcome {
        Ok(result) => result.map_err(io_error)?,
        Err(e) => return Err(io_error(io::Error::other(e))),
    }

    info!("backup {name} saved to {}", target.display());
    Ok(target)
}

fn write_atomically(dir: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.flush()?;
    file.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::driver::ConnectionManager;
    use crate::platform;
    use crate::testing::{MockConnector, MockTransport, Reply, ssh_config};

    async fn manager(transport: &MockTransport) -> ConnectionManager<MockConnector> {
        let manager = ConnectionManager::new(MockConnector::new(transport.clone()));
        manager.connect(&ssh_config()).await.unwrap();
        manager
    }

    #[test]
    fn test_backup_name() {
        assert_eq!(backup_name("nightly").unwrap(), "nightly");
        assert_eq!(backup_name("nightly.backup").unwrap(), "nightly");
        assert_eq!(backup_name("2025-03-01_gw").unwrap(), "2025-03-01_gw");
        assert!(backup_name("").is_err());
        assert!(backup_name(".backup").is_err());
        assert!(backup_name(".hidden").is_err());
        assert!(backup_name("../etc/passwd").is_err());
        assert!(backup_name("a b").is_err());
        assert!(backup_name(&"a".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let transport = MockTransport::new();
        transport.add_file("b.backup", b"x");
        transport.add_file("a.backup", b"x");
        transport.add_file("autosupout.rif", b"x");
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let files = BackupGateway::new(exec).list().await.unwrap();
        assert_eq!(files, vec!["a.backup", "b.backup"]);
    }

    #[tokio::test]
    async fn test_create_then_fetch_round_trip() {
        let transport = MockTransport::new();
        transport.add_file_after("x.backup", b"\x88\xac\xa1\xb1config", 2);
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));
        let backups = BackupGateway::new(exec).with_polling(5, Duration::from_millis(1));

        assert_eq!(backups.create("x").await.unwrap(), "x.backup");
        assert_eq!(transport.commands(), vec![r#"/system backup save name="x""#]);
        assert_eq!(transport.listings(), 2);
        assert!(backups.list().await.unwrap().contains(&"x.backup".to_string()));

        let data = backups.fetch("x.backup").await.unwrap();
        assert!(!data.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = backups.fetch_to("x.backup", dir.path()).await.unwrap();
        assert_eq!(fs::read(&path).unwrap(), data.to_vec());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_create_times_out() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = BackupGateway::new(exec)
            .with_polling(3, Duration::from_millis(1))
            .create("never")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackupTimeout { attempts: 3, .. }));
        assert_eq!(transport.listings(), 3);
    }

    #[tokio::test]
    async fn test_existing_backup_must_be_rewritten() {
        let transport = MockTransport::new();
        transport.add_file("nightly.backup", b"last week");
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        // Save accepted but nothing written: the old file must not count
        let err = BackupGateway::new(exec)
            .with_polling(3, Duration::from_millis(1))
            .create("nightly")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackupTimeout { attempts: 3, .. }));
        assert_eq!(transport.listings(), 3);
    }

    #[tokio::test]
    async fn test_existing_backup_rewritten() {
        let transport = MockTransport::new();
        transport.add_file("nightly.backup", b"last week");
        transport.add_file_after("nightly.backup", b"tonight", 2);
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));
        let backups = BackupGateway::new(exec).with_polling(5, Duration::from_millis(1));

        assert_eq!(backups.create("nightly").await.unwrap(), "nightly.backup");
        assert_eq!(transport.listings(), 2);
        assert_eq!(&backups.fetch("nightly.backup").await.unwrap()[..], b"tonight");
    }

    #[tokio::test]
    async fn test_rejected_save_does_not_poll() {
        let transport = MockTransport::new();
        transport.on("/system backup save", |_| {
            Reply::stdout("failure: not enough disk space")
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = BackupGateway::new(exec).create("x").await.unwrap_err();
        assert!(matches!(err, Error::CommandRejected { .. }));
        assert_eq!(transport.listings(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_nothing() {
        let transport = MockTransport::new();
        transport.add_file("empty.backup", b"");
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));
        let backups = BackupGateway::new(exec);
        let dir = tempfile::tempdir().unwrap();

        let err = backups.fetch_to("missing.backup", dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let err = backups.fetch_to("empty.backup", dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::EmptyTransfer { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
