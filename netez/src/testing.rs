//! Scripted device for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resources::ResourceKind;
use crate::transport::{AuthMethod, Connector, ExecOutput, FileStat, SshConfig, Transport};

type Rule = Box<dyn Fn(&str) -> Reply + Send + Sync>;

/// What the scripted device answers to a command.
pub(crate) enum Reply {
    Output(ExecOutput),
    Broken,
    Delayed(Duration),
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Reply::Output(ExecOutput {
            exit_status: Some(0),
            ..Default::default()
        })
    }

    pub(crate) fn stdout(text: &str) -> Self {
        Reply::Output(ExecOutput {
            exit_status: Some(0),
            stdout: text.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    pub(crate) fn stderr(text: &str) -> Self {
        Reply::Output(ExecOutput {
            exit_status: Some(0),
            stdout: Vec::new(),
            stderr: text.as_bytes().to_vec(),
        })
    }

    pub(crate) fn exit(code: u32) -> Self {
        Reply::Output(ExecOutput {
            exit_status: Some(code),
            ..Default::default()
        })
    }

    pub(crate) fn broken() -> Self {
        Reply::Broken
    }

    pub(crate) fn delayed(delay: Duration) -> Self {
        Reply::Delayed(delay)
    }
}

struct PendingFile {
    name: String,
    data: Vec<u8>,
    after_listings: u32,
}

#[derive(Default)]
struct Inner {
    rules: Mutex<Vec<(String, Rule)>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, (Vec<u8>, u32)>>,
    writes: AtomicU32,
    pending: Mutex<Vec<PendingFile>>,
    listings: AtomicU32,
    dead: AtomicBool,
    closed: AtomicBool,
}

/// A transport whose answers are scripted per command substring.
///
/// The most recently registered matching rule wins; unmatched commands
/// succeed with empty output.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, pattern: &str, reply: impl Fn(&str) -> Reply + Send + Sync + 'static) {
        if let Ok(mut rules) = self.inner.rules.lock() {
            rules.push((pattern.to_string(), Box::new(reply)));
        }
    }

    pub(crate) fn add_file(&self, name: &str, data: &[u8]) {
        if let Ok(mut files) = self.inner.files.lock() {
            files.insert(name.to_string(), (data.to_vec(), self.next_write()));
        }
    }

    /// The file shows up once the directory has been listed `after` times.
    pub(crate) fn add_file_after(&self, name: &str, data: &[u8], after: u32) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.push(PendingFile {
                name: name.to_string(),
                data: data.to_vec(),
                after_listings: after,
            });
        }
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.inner
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub(crate) fn listings(&self) -> u32 {
        self.inner.listings.load(Ordering::SeqCst)
    }

    pub(crate) fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stands in for a file's modification time.
    fn next_write(&self) -> u32 {
        self.inner.writes.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn revive(&self) {
        self.inner.dead.store(false, Ordering::SeqCst);
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.dead.load(Ordering::SeqCst) || self.is_closed() {
            return Err(Error::transport("connection lost"));
        }
        Ok(())
    }

    fn reply_for(&self, command: &str) -> Reply {
        let rules = match self.inner.rules.lock() {
            Ok(rules) => rules,
            Err(_) => return Reply::Broken,
        };
        rules
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, rule)| rule(command))
            .unwrap_or_else(Reply::ok)
    }
}

impl Transport for MockTransport {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.check_alive()?;
        if let Ok(mut commands) = self.inner.commands.lock() {
            commands.push(command.to_string());
        }
        match self.reply_for(command) {
            Reply::Output(output) => Ok(output),
            Reply::Broken => {
                self.kill();
                Err(Error::transport("channel closed"))
            }
            Reply::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ExecOutput::default())
            }
        }
    }

    async fn list_dir(&self, _path: &str) -> Result<Vec<String>> {
        self.check_alive()?;
        let listings = self.inner.listings.fetch_add(1, Ordering::SeqCst) + 1;
        if let (Ok(mut pending), Ok(mut files)) =
            (self.inner.pending.lock(), self.inner.files.lock())
        {
            pending.retain(|file| {
                if listings >= file.after_listings {
                    files.insert(file.name.clone(), (file.data.clone(), self.next_write()));
                    false
                } else {
                    true
                }
            });
        }
        Ok(self
            .inner
            .files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        self.check_alive()?;
        let name = path.trim_start_matches('/');
        self.inner
            .files
            .lock()
            .ok()
            .and_then(|files| files.get(name).map(|(data, _)| data.clone()))
            .map(Bytes::from)
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::Backup,
                id: path.to_string(),
                message: "no such file".into(),
            })
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        self.check_alive()?;
        let name = path.trim_start_matches('/');
        Ok(self.inner.files.lock().ok().and_then(|files| {
            files.get(name).map(|(data, written)| FileStat {
                size: Some(data.len() as u64),
                modified: Some(*written),
            })
        }))
    }

    fn is_alive(&self) -> bool {
        self.check_alive().is_ok()
    }

    async fn close(self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out one shared mock transport.
pub(crate) struct MockConnector {
    transport: MockTransport,
    failure: Option<fn() -> Error>,
}

impl MockConnector {
    pub(crate) fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            failure: None,
        }
    }

    pub(crate) fn failing(failure: fn() -> Error) -> Self {
        Self {
            transport: MockTransport::new(),
            failure: Some(failure),
        }
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, _config: &SshConfig) -> Result<MockTransport> {
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        self.transport.revive();
        Ok(self.transport.clone())
    }
}

pub(crate) fn ssh_config() -> SshConfig {
    SshConfig::new("192.0.2.1", 22, "admin", AuthMethod::password("secret"))
}
