//! POP-style views over a set of messages.
//!
//! A view is a snapshot: message indices stay stable for its lifetime,
//! and messages that arrive afterwards only show up after `refresh`.
//! Deletion is two-phase. `delete_message` marks, `undelete_messages`
//! clears the marks, and `sync` makes the marked deletions permanent.
use crate::{unique_name, Maildir, MaildirError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub type MessageReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// The size of every message in the view, in order.
    /// Deleted messages report 0.
    fn list_messages(&self) -> Vec<u64>;

    /// The size of a single message; 0 if it has been deleted.
    fn message_size(&self, index: usize) -> Result<u64, MaildirError>;

    async fn get_message(&self, index: usize) -> Result<MessageReader, MaildirError>;

    /// An identifier for the message that stays the same across
    /// sessions and process restarts
    fn get_uidl(&self, index: usize) -> Result<String, MaildirError>;

    fn delete_message(&mut self, index: usize) -> Result<(), MaildirError>;

    fn undelete_messages(&mut self);

    async fn sync(&mut self) -> Result<(), MaildirError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Present,
    /// Marked; can still be undeleted
    Deleted,
    /// Gone for good
    Purged,
}

fn digest_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..16])
}

struct Entry {
    path: PathBuf,
    size: u64,
    state: EntryState,
}

/// A mailbox view over a maildir
pub struct MaildirMailbox {
    maildir: Arc<Maildir>,
    entries: Vec<Entry>,
}

impl MaildirMailbox {
    pub fn open(maildir: Arc<Maildir>) -> Result<Self, MaildirError> {
        let mut mailbox = Self {
            maildir,
            entries: vec![],
        };
        mailbox.refresh()?;
        Ok(mailbox)
    }

    pub fn maildir(&self) -> &Arc<Maildir> {
        &self.maildir
    }

    /// Re-read the maildir. Pending deletion marks are kept for
    /// messages that are still present.
    pub fn refresh(&mut self) -> Result<(), MaildirError> {
        let deleted: HashSet<PathBuf> = self
            .entries
            .iter()
            .filter(|entry| entry.state == EntryState::Deleted)
            .map(|entry| entry.path.clone())
            .collect();

        let mut entries = vec![];
        for path in self.maildir.list_paths()? {
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                // Raced with another session moving it away
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let state = if deleted.contains(&path) {
                EntryState::Deleted
            } else {
                EntryState::Present
            };
            entries.push(Entry { path, size, state });
        }

        self.entries = entries;
        Ok(())
    }

    fn entry(&self, index: usize) -> Result<&Entry, MaildirError> {
        self.entries
            .get(index)
            .ok_or(MaildirError::IndexOutOfRange(index))
    }
}

#[async_trait]
impl Mailbox for MaildirMailbox {
    fn list_messages(&self) -> Vec<u64> {
        self.entries
            .iter()
            .map(|entry| match entry.state {
                EntryState::Present => entry.size,
                EntryState::Deleted | EntryState::Purged => 0,
            })
            .collect()
    }

    fn message_size(&self, index: usize) -> Result<u64, MaildirError> {
        let entry = self.entry(index)?;
        Ok(match entry.state {
            EntryState::Present => entry.size,
            EntryState::Deleted | EntryState::Purged => 0,
        })
    }

    async fn get_message(&self, index: usize) -> Result<MessageReader, MaildirError> {
        let entry = self.entry(index)?;
        if entry.state != EntryState::Present {
            return Err(MaildirError::Deleted(index));
        }
        let file = tokio::fs::File::open(&entry.path).await?;
        Ok(Box::new(file))
    }

    fn get_uidl(&self, index: usize) -> Result<String, MaildirError> {
        let entry = self.entry(index)?;
        let file_name = entry
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(digest_hex(unique_name(&file_name).as_bytes()))
    }

    fn delete_message(&mut self, index: usize) -> Result<(), MaildirError> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(MaildirError::IndexOutOfRange(index))?;
        match entry.state {
            EntryState::Present => {
                entry.state = EntryState::Deleted;
                Ok(())
            }
            EntryState::Deleted => Ok(()),
            EntryState::Purged => Err(MaildirError::Deleted(index)),
        }
    }

    fn undelete_messages(&mut self) {
        for entry in &mut self.entries {
            if entry.state == EntryState::Deleted {
                entry.state = EntryState::Present;
            }
        }
    }

    async fn sync(&mut self) -> Result<(), MaildirError> {
        let trash = self.maildir.trash_path().join("cur");
        for entry in &mut self.entries {
            if entry.state != EntryState::Deleted {
                continue;
            }
            let Some(file_name) = entry.path.file_name() else {
                continue;
            };
            let dest = trash.join(file_name);
            tokio::fs::rename(&entry.path, &dest).await?;
            tracing::trace!("moved {} to {}", entry.path.display(), dest.display());
            entry.state = EntryState::Purged;
        }
        Ok(())
    }
}

/// A mailbox held entirely in memory
pub struct StringListMailbox {
    messages: Vec<String>,
    states: Vec<EntryState>,
}

impl StringListMailbox {
    pub fn new<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let messages: Vec<String> = messages.into_iter().map(Into::into).collect();
        let states = vec![EntryState::Present; messages.len()];
        Self { messages, states }
    }

    fn check(&self, index: usize) -> Result<EntryState, MaildirError> {
        self.states
            .get(index)
            .copied()
            .ok_or(MaildirError::IndexOutOfRange(index))
    }
}

#[async_trait]
impl Mailbox for StringListMailbox {
    fn list_messages(&self) -> Vec<u64> {
        (0..self.messages.len())
            .map(|idx| self.message_size(idx).unwrap_or(0))
            .collect()
    }

    fn message_size(&self, index: usize) -> Result<u64, MaildirError> {
        Ok(match self.check(index)? {
            EntryState::Present => self.messages[index].len() as u64,
            EntryState::Deleted | EntryState::Purged => 0,
        })
    }

    async fn get_message(&self, index: usize) -> Result<MessageReader, MaildirError> {
        if self.check(index)? != EntryState::Present {
            return Err(MaildirError::Deleted(index));
        }
        Ok(Box::new(Cursor::new(self.messages[index].clone().into_bytes())))
    }

    fn get_uidl(&self, index: usize) -> Result<String, MaildirError> {
        self.check(index)?;
        Ok(digest_hex(
            format!("{index}\0{}", self.messages[index]).as_bytes(),
        ))
    }

    fn delete_message(&mut self, index: usize) -> Result<(), MaildirError> {
        match self.check(index)? {
            EntryState::Present | EntryState::Deleted => {
                self.states[index] = EntryState::Deleted;
                Ok(())
            }
            EntryState::Purged => Err(MaildirError::Deleted(index)),
        }
    }

    fn undelete_messages(&mut self) {
        for state in &mut self.states {
            if *state == EntryState::Deleted {
                *state = EntryState::Present;
            }
        }
    }

    async fn sync(&mut self) -> Result<(), MaildirError> {
        for state in &mut self.states {
            if *state == EntryState::Deleted {
                *state = EntryState::Purged;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: MessageReader) -> String {
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        text
    }

    #[tokio::test]
    async fn string_list_lengths() {
        let mailbox = StringListMailbox::new(["abc", "ab", "a"]);
        assert_eq!(mailbox.list_messages(), vec![3, 2, 1]);
        assert_eq!(mailbox.message_size(1).unwrap(), 2);
        assert!(matches!(
            mailbox.message_size(3),
            Err(MaildirError::IndexOutOfRange(3))
        ));
        assert_eq!(read_all(mailbox.get_message(2).await.unwrap()).await, "a");
    }

    #[tokio::test]
    async fn string_list_uidls_are_distinct() {
        let mailbox = StringListMailbox::new(["same", "same", "other"]);
        let uidls: HashSet<String> = (0..3).map(|i| mailbox.get_uidl(i).unwrap()).collect();
        assert_eq!(uidls.len(), 3);
    }

    #[tokio::test]
    async fn string_list_delete_then_undelete() {
        let mut mailbox = StringListMailbox::new(["abc", "ab"]);
        mailbox.delete_message(0).unwrap();
        assert_eq!(mailbox.list_messages(), vec![0, 2]);
        assert!(matches!(
            mailbox.get_message(0).await,
            Err(MaildirError::Deleted(0))
        ));
        mailbox.undelete_messages();
        assert_eq!(mailbox.list_messages(), vec![3, 2]);
    }

    #[tokio::test]
    async fn string_list_sync_is_permanent() {
        let mut mailbox = StringListMailbox::new(["abc", "ab"]);
        mailbox.delete_message(0).unwrap();
        mailbox.sync().await.unwrap();
        mailbox.undelete_messages();
        assert_eq!(mailbox.list_messages(), vec![0, 2]);
        assert!(mailbox.delete_message(0).is_err());
    }
}
