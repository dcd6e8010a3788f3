use crate::{Envelope, MessageState, QueueError, QueueId};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};

const ENVELOPE: &str = "H";
const BODY: &str = "D";
const RELAYING: &str = "R";

#[derive(Default)]
struct QueueState {
    waiting: BTreeSet<QueueId>,
    relaying: BTreeSet<QueueId>,
}

impl QueueState {
    fn state_of(&self, id: QueueId) -> Option<MessageState> {
        if self.waiting.contains(&id) {
            Some(MessageState::Waiting)
        } else if self.relaying.contains(&id) {
            Some(MessageState::Relaying)
        } else {
            None
        }
    }

    /// Move `id` from the `from` set to the other one
    fn transition(&mut self, id: QueueId, from: MessageState) -> Result<(), QueueError> {
        let actual = self.state_of(id).ok_or(QueueError::UnknownMessage(id))?;
        if actual != from {
            return Err(QueueError::InvalidTransition {
                id,
                expected: from,
                actual,
            });
        }
        match from {
            MessageState::Waiting => {
                self.waiting.remove(&id);
                self.relaying.insert(id);
            }
            MessageState::Relaying => {
                self.relaying.remove(&id);
                self.waiting.insert(id);
            }
        }
        Ok(())
    }
}

struct Inner {
    path: PathBuf,
    state: Mutex<QueueState>,
    /// Held while the directory and `state` are being brought into
    /// agreement, so a scan never overwrites a concurrent change
    changes: tokio::sync::Mutex<()>,
    _pid_file: File,
}

/// A directory of queued messages.
///
/// Each message is a pair of files, `<id>-H` holding the JSON envelope
/// and `<id>-D` holding the body, plus an `<id>-R` marker while it is
/// being relayed. New messages are staged in `tmp/` and are renamed
/// into place only once both halves are complete.
///
/// A process holds an exclusive lock on the queue directory for as
/// long as any clone of the `DeliveryQueue` is alive.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    /// Lock and prepare the queue directory.
    /// Call `read_directory` to load the messages it already holds.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let pid_file_path = path.join("lock");
        let _pid_file = lock_pid_file(pid_file_path)?;

        let tmp = path.join("tmp");
        std::fs::create_dir_all(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        Self::cleanup_staging(&tmp);

        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                state: Mutex::new(QueueState::default()),
                changes: tokio::sync::Mutex::new(()),
                _pid_file,
            }),
        })
    }

    /// Remove anything left behind by writers that never finished
    fn cleanup_staging(tmp: &Path) {
        let Ok(entries) = std::fs::read_dir(tmp) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::error!("Failed to remove {path:?}: {err:#}");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The common prefix of the files that make up message `id`
    pub fn get_path(&self, id: QueueId) -> PathBuf {
        self.inner.path.join(id.to_string())
    }

    fn file_path(&self, id: QueueId, kind: &str) -> PathBuf {
        self.inner.path.join(format!("{id}-{kind}"))
    }

    fn staging_path(&self, id: QueueId, kind: &str) -> PathBuf {
        self.inner.path.join("tmp").join(format!("{id}-{kind}"))
    }

    /// Allocate a new message. It becomes visible once both the
    /// envelope and the body have been written.
    pub async fn create_new_message(&self) -> Result<NewMessage, QueueError> {
        let id = QueueId::new();
        let body_path = self.staging_path(id, BODY);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&body_path)
            .await
            .map_err(QueueError::io(format!(
                "failed to create {}",
                body_path.display()
            )))?;

        let staging = Arc::new(Staging {
            queue: self.clone(),
            id,
            progress: Mutex::new(Progress::default()),
        });

        Ok(NewMessage {
            id,
            envelope: EnvelopeWriter {
                staging: staging.clone(),
                done: false,
            },
            body: BodyWriter {
                staging,
                file: BufWriter::new(file),
                done: false,
            },
        })
    }

    async fn publish(&self, id: QueueId) -> Result<(), QueueError> {
        let staged_envelope = self.staging_path(id, ENVELOPE);
        let staged_body = self.staging_path(id, BODY);
        let envelope = self.file_path(id, ENVELOPE);
        let body = self.file_path(id, BODY);
        let _changing = self.inner.changes.lock().await;

        // The message is complete, and thus visible, once the body lands
        if let Err(err) = tokio::fs::rename(&staged_envelope, &envelope).await {
            tokio::fs::remove_file(&staged_body).await.ok();
            tokio::fs::remove_file(&staged_envelope).await.ok();
            return Err(QueueError::io(format!("failed to publish envelope for {id}"))(err));
        }
        if let Err(err) = tokio::fs::rename(&staged_body, &body).await {
            tokio::fs::remove_file(&envelope).await.ok();
            tokio::fs::remove_file(&staged_body).await.ok();
            return Err(QueueError::io(format!("failed to publish body for {id}"))(err));
        }

        self.inner.state.lock().waiting.insert(id);
        tracing::debug!("queued {id}");
        Ok(())
    }

    /// Rebuild the in-memory view from the directory contents.
    /// Messages with a relay marker are classified as relaying.
    /// A message with only one of its halves was interrupted part way
    /// through being published or removed; its files are reclaimed.
    pub async fn read_directory(&self) -> Result<(), QueueError> {
        #[derive(Default)]
        struct Found {
            envelope: bool,
            body: bool,
            relaying: bool,
        }

        let path = &self.inner.path;
        let _changing = self.inner.changes.lock().await;
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(QueueError::io(format!("failed to read {}", path.display())))?;

        let mut found: BTreeMap<QueueId, Found> = BTreeMap::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(QueueError::io(format!("failed to read {}", path.display())))?
        {
            let name = entry.file_name();
            let Some((id, kind)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            let slot = found.entry(id).or_default();
            match kind {
                ENVELOPE => slot.envelope = true,
                BODY => slot.body = true,
                RELAYING => slot.relaying = true,
                _ => {}
            }
        }

        let mut state = QueueState::default();
        for (id, slot) in found {
            if slot.envelope && slot.body {
                if slot.relaying {
                    state.relaying.insert(id);
                } else {
                    state.waiting.insert(id);
                }
            } else {
                tracing::warn!("reclaiming the remains of incomplete message {id}");
                for (kind, present) in [
                    (ENVELOPE, slot.envelope),
                    (BODY, slot.body),
                    (RELAYING, slot.relaying),
                ] {
                    if present {
                        let path = self.file_path(id, kind);
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            tracing::error!("failed to remove {}: {err:#}", path.display());
                        }
                    }
                }
            }
        }

        *self.inner.state.lock() = state;
        Ok(())
    }

    /// Waiting messages, oldest first
    pub fn get_waiting(&self) -> Vec<QueueId> {
        self.inner.state.lock().waiting.iter().copied().collect()
    }

    pub fn get_relaying(&self) -> Vec<QueueId> {
        self.inner.state.lock().relaying.iter().copied().collect()
    }

    pub fn has_waiting(&self) -> bool {
        !self.inner.state.lock().waiting.is_empty()
    }

    pub fn state_of(&self, id: QueueId) -> Option<MessageState> {
        self.inner.state.lock().state_of(id)
    }

    /// Mark a waiting message as being relayed
    pub async fn set_relaying(&self, id: QueueId) -> Result<(), QueueError> {
        let _changing = self.inner.changes.lock().await;
        self.inner
            .state
            .lock()
            .transition(id, MessageState::Waiting)?;

        let marker = self.file_path(id, RELAYING);
        if let Err(err) = tokio::fs::write(&marker, b"").await {
            self.inner
                .state
                .lock()
                .transition(id, MessageState::Relaying)
                .ok();
            return Err(QueueError::io(format!(
                "failed to create relay marker {}",
                marker.display()
            ))(err));
        }
        Ok(())
    }

    /// Return a message that was being relayed to the waiting set
    pub async fn set_waiting(&self, id: QueueId) -> Result<(), QueueError> {
        let _changing = self.inner.changes.lock().await;
        self.inner
            .state
            .lock()
            .transition(id, MessageState::Relaying)?;

        let marker = self.file_path(id, RELAYING);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                self.inner
                    .state
                    .lock()
                    .transition(id, MessageState::Waiting)
                    .ok();
                Err(QueueError::io(format!(
                    "failed to remove relay marker {}",
                    marker.display()
                ))(err))
            }
        }
    }

    /// Return every relaying message to the waiting set.
    /// Markers that survive a restart belong to sessions that died
    /// with the previous process.
    pub async fn requeue_relaying(&self) -> Result<usize, QueueError> {
        let relaying = self.get_relaying();
        for &id in &relaying {
            self.set_waiting(id).await?;
        }
        Ok(relaying.len())
    }

    /// Permanently remove a message that has been relayed or
    /// rejected outright
    pub async fn done(&self, id: QueueId) -> Result<(), QueueError> {
        let _changing = self.inner.changes.lock().await;
        {
            let mut state = self.inner.state.lock();
            match state.state_of(id) {
                Some(MessageState::Relaying) => {
                    state.relaying.remove(&id);
                }
                Some(actual) => {
                    return Err(QueueError::InvalidTransition {
                        id,
                        expected: MessageState::Relaying,
                        actual,
                    })
                }
                None => return Err(QueueError::UnknownMessage(id)),
            }
        }

        // Body first: a lone envelope left by a crash is reclaimed by
        // the next scan
        for kind in [BODY, ENVELOPE, RELAYING] {
            let path = self.file_path(id, kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(QueueError::io(format!(
                        "failed to remove {}",
                        path.display()
                    ))(err))
                }
            }
        }
        tracing::debug!("removed {id}");
        Ok(())
    }

    pub async fn get_envelope(&self, id: QueueId) -> Result<Envelope, QueueError> {
        let path = self.file_path(id, ENVELOPE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::UnknownMessage(id))
            }
            Err(err) => {
                return Err(QueueError::io(format!("failed to load {}", path.display()))(err))
            }
        };
        serde_json::from_slice(&data).map_err(|source| QueueError::Envelope { id, source })
    }

    pub async fn get_mail_data(&self, id: QueueId) -> Result<tokio::fs::File, QueueError> {
        let path = self.file_path(id, BODY);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::UnknownMessage(id))
            }
            Err(err) => Err(QueueError::io(format!("failed to open {}", path.display()))(err)),
        }
    }
}

fn parse_file_name(name: &str) -> Option<(QueueId, &str)> {
    let (id, kind) = name.rsplit_once('-')?;
    let id = id.parse().ok()?;
    Some((id, kind))
}

#[derive(Default)]
struct Progress {
    envelope: bool,
    body: bool,
    abandoned: bool,
}

enum Part {
    Envelope,
    Body,
}

/// Shared between the two writers of a new message; whichever
/// finishes second publishes it
struct Staging {
    queue: DeliveryQueue,
    id: QueueId,
    progress: Mutex<Progress>,
}

impl Staging {
    async fn complete(&self, part: Part) -> Result<(), QueueError> {
        let publish = {
            let mut progress = self.progress.lock();
            if progress.abandoned {
                return Err(QueueError::Abandoned(self.id));
            }
            match part {
                Part::Envelope => progress.envelope = true,
                Part::Body => progress.body = true,
            }
            progress.envelope && progress.body
        };
        if publish {
            self.queue.publish(self.id).await?;
        }
        Ok(())
    }

    fn abandon(&self) {
        {
            let mut progress = self.progress.lock();
            if progress.abandoned || (progress.envelope && progress.body) {
                return;
            }
            progress.abandoned = true;
        }
        for kind in [ENVELOPE, BODY] {
            std::fs::remove_file(self.queue.staging_path(self.id, kind)).ok();
        }
        tracing::debug!("abandoned incomplete message {}", self.id);
    }
}

/// The two halves of a message being added to the queue
pub struct NewMessage {
    pub id: QueueId,
    pub envelope: EnvelopeWriter,
    pub body: BodyWriter,
}

pub struct EnvelopeWriter {
    staging: Arc<Staging>,
    done: bool,
}

impl EnvelopeWriter {
    pub fn id(&self) -> QueueId {
        self.staging.id
    }

    pub async fn write(mut self, envelope: &Envelope) -> Result<(), QueueError> {
        let id = self.staging.id;
        let path = self.staging.queue.staging_path(id, ENVELOPE);
        let data = serde_json::to_vec(envelope)
            .map_err(|source| QueueError::Envelope { id, source })?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(QueueError::io(format!("failed to create {}", path.display())))?;
        file.write_all(&data)
            .await
            .map_err(QueueError::io(format!("failed to write envelope for {id}")))?;
        file.sync_all()
            .await
            .map_err(QueueError::io(format!("failed to sync envelope for {id}")))?;

        self.done = true;
        self.staging.complete(Part::Envelope).await
    }
}

impl Drop for EnvelopeWriter {
    fn drop(&mut self) {
        if !self.done {
            self.staging.abandon();
        }
    }
}

pub struct BodyWriter {
    staging: Arc<Staging>,
    file: BufWriter<tokio::fs::File>,
    done: bool,
}

impl BodyWriter {
    pub fn id(&self) -> QueueId {
        self.staging.id
    }

    /// Append one line; the line terminator is added here
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), QueueError> {
        let id = self.staging.id;
        self.file
            .write_all(line)
            .await
            .map_err(QueueError::io(format!("failed to write body for {id}")))?;
        self.file
            .write_all(b"\n")
            .await
            .map_err(QueueError::io(format!("failed to write body for {id}")))
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), QueueError> {
        let id = self.staging.id;
        self.file
            .write_all(data)
            .await
            .map_err(QueueError::io(format!("failed to write body for {id}")))
    }

    /// Flush the body to disk; corresponds to the end of the message
    pub async fn finish(mut self) -> Result<(), QueueError> {
        let id = self.staging.id;
        self.file
            .flush()
            .await
            .map_err(QueueError::io(format!("failed to flush body for {id}")))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(QueueError::io(format!("failed to sync body for {id}")))?;

        self.done = true;
        self.staging.complete(Part::Body).await
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        if !self.done {
            self.staging.abandon();
        }
    }
}

/// Set the sticky bit on path.
/// This prevents tmpwatch from removing the lock file.
fn set_sticky_bit(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = path.metadata() {
        let mut perms = metadata.permissions();
        let mode = perms.mode();
        perms.set_mode(mode | libc::S_ISVTX as u32);
        let _ = std::fs::set_permissions(path, perms);
    }
}

fn lock_pid_file(pid_file: PathBuf) -> anyhow::Result<std::fs::File> {
    let pid_file_dir = pid_file
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent?", pid_file.display()))?;
    std::fs::create_dir_all(pid_file_dir).with_context(|| {
        format!(
            "while creating directory structure: {}",
            pid_file_dir.display()
        )
    })?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&pid_file)
        .with_context(|| format!("opening pid file {}", pid_file.display()))?;
    set_sticky_bit(&pid_file);
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res != 0 {
        let err = std::io::Error::last_os_error();

        let owner = match std::fs::read_to_string(&pid_file) {
            Ok(pid) => format!(". Owned by pid {}.", pid.trim()),
            Err(_) => "".to_string(),
        };

        anyhow::bail!(
            "unable to lock queue {}: {}{owner}",
            pid_file.display(),
            err
        );
    }

    file.set_len(0)
        .with_context(|| format!("truncating pid file {}", pid_file.display()))?;
    writeln!(file, "{}", std::process::id()).ok();

    Ok(file)
}
