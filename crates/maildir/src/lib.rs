use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use std::{error, fmt};
use tern_clock::{Clock, SystemClock};
use tokio::io::{AsyncRead, AsyncWriteExt};

mod mailbox;

pub use mailbox::{Mailbox, MaildirMailbox, StringListMailbox};

#[cfg(unix)]
const INFORMATIONAL_SUFFIX_SEPARATOR: &str = ":";
#[cfg(windows)]
const INFORMATIONAL_SUFFIX_SEPARATOR: &str = ";";

pub const TRASH: &str = ".Trash";

#[derive(Debug)]
pub enum MaildirError {
    Io(std::io::Error),
    IndexOutOfRange(usize),
    Deleted(usize),
}

impl fmt::Display for MaildirError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use MaildirError::*;

        match *self {
            Io(ref e) => write!(f, "IO Error: {}", e),
            IndexOutOfRange(idx) => write!(f, "No message at index {idx}"),
            Deleted(idx) => write!(f, "Message {idx} has been deleted"),
        }
    }
}

impl error::Error for MaildirError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use MaildirError::*;

        match *self {
            Io(ref e) => Some(e),
            IndexOutOfRange(_) | Deleted(_) => None,
        }
    }
}

impl From<std::io::Error> for MaildirError {
    fn from(e: std::io::Error) -> MaildirError {
        MaildirError::Io(e)
    }
}

#[derive(Default)]
struct GeneratorState {
    last: Duration,
    seq: u64,
}

/// Produces unique message file names.
///
/// Names follow the usual `<secs>.M<usec>P<pid>Q<seq>.<host>` shape with
/// fixed-width time and sequence fields, so that lexical order is
/// generation order. The timestamp never goes backwards, even if the
/// wall clock does.
pub struct NameGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
    pid: u32,
    hostname: String,
}

impl NameGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let hostname = gethostname::gethostname()
            .into_string()
            // the hostname is always ASCII in order to be a valid DNS
            // name, so into_string() will always succeed. The error case
            // here is to satisfy the compiler which doesn't know this.
            .unwrap_or_else(|_| "localhost".to_string())
            // '/' and ':' have meaning in a maildir file name
            .replace('/', "\\057")
            .replace(':', "\\072");

        Self {
            clock,
            state: Mutex::new(GeneratorState::default()),
            pid: std::process::id(),
            hostname,
        }
    }

    pub fn generate(&self) -> String {
        let now = self
            .clock
            .system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let mut state = self.state.lock();
        if now > state.last {
            state.last = now;
        }
        state.seq += 1;

        format!(
            "{:010}.M{:06}P{}Q{:016x}.{}",
            state.last.as_secs(),
            state.last.subsec_micros(),
            self.pid,
            state.seq,
            self.hostname
        )
    }
}

/// One maildir on disk: the folder containing `cur`, `new` and `tmp`.
///
/// Appends through a single `Maildir` instance are serialized, so the
/// order in which appends complete matches the order of their names.
/// Share the instance (it is usually held in an `Arc`) between all of
/// the writers of a given mailbox.
pub struct Maildir {
    path: PathBuf,
    names: NameGenerator,
    append_lock: tokio::sync::Mutex<()>,
    #[cfg(unix)]
    dir_mode: Option<u32>,
    #[cfg(unix)]
    file_mode: Option<u32>,
}

impl Maildir {
    /// Create a Maildir from a path-compatible parameter
    pub fn with_path<P: Into<PathBuf>>(p: P) -> Self {
        Self::with_clock(p, SystemClock::shared())
    }

    pub fn with_clock<P: Into<PathBuf>>(p: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: p.into(),
            names: NameGenerator::new(clock),
            append_lock: tokio::sync::Mutex::new(()),
            #[cfg(unix)]
            dir_mode: None,
            #[cfg(unix)]
            file_mode: None,
        }
    }

    /// The permission mode for directories created by `initialize`.
    /// When unset, directories get the umask defaults.
    /// Existing directories are left alone.
    #[cfg(unix)]
    pub fn with_dir_mode(mut self, dir_mode: Option<u32>) -> Self {
        self.dir_mode = dir_mode;
        self
    }

    /// The permission mode for new message files, subject to the umask
    #[cfg(unix)]
    pub fn with_file_mode(mut self, file_mode: Option<u32>) -> Self {
        self.file_mode = file_mode;
        self
    }

    /// Returns the path of the maildir base folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the trash maildir nested in this one
    pub fn trash_path(&self) -> PathBuf {
        self.path.join(TRASH)
    }

    /// Creates the directory structure of the mailbox together with
    /// its `.Trash` folder. Safe to call on an existing maildir.
    pub fn initialize(&self) -> std::io::Result<()> {
        self.create_triad(&self.path)?;
        self.create_triad(&self.trash_path())
    }

    fn create_triad(&self, base: &Path) -> std::io::Result<()> {
        let mut path = base.to_path_buf();
        for d in &["cur", "new", "tmp"] {
            path.push(d);
            self.create_dir_all(path.as_path())?;
            path.pop();
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        'retry: loop {
            match path.metadata() {
                Ok(meta) => {
                    if meta.is_dir() {
                        return Ok(());
                    }
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotADirectory,
                        format!(
                            "{} already exists as non-directory {meta:?}",
                            path.display()
                        ),
                    ));
                }
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return Err(err);
                    }

                    if let Some(parent) = path.parent() {
                        self.create_dir_all(parent)?;
                    }

                    if let Err(err) = std::fs::create_dir(path) {
                        match err.kind() {
                            std::io::ErrorKind::AlreadyExists => {
                                // Someone else made it; find out what it is
                                continue 'retry;
                            }
                            std::io::ErrorKind::IsADirectory => {
                                // We lost a race to create it,
                                // but the outcome is the one we wanted.
                                return Ok(());
                            }
                            _ => {
                                return Err(err);
                            }
                        }
                    }

                    #[cfg(unix)]
                    if let Some(mode) = self.dir_mode {
                        chmod(path, mode)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Stores `data` as a new message in the `new` folder.
    /// Returns the name of the message file.
    pub async fn append_message(&self, data: &[u8]) -> Result<String, MaildirError> {
        let mut reader = data;
        self.append_reader(&mut reader).await
    }

    /// Stores the contents of `reader` as a new message in the `new`
    /// folder. The data is written to `tmp` first and only renamed into
    /// `new` once it has been synced, so a message is never observed
    /// partially written. On failure nothing is left behind in either
    /// folder and the same append may simply be retried.
    pub async fn append_reader<R>(&self, reader: &mut R) -> Result<String, MaildirError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let _serialize = self.append_lock.lock().await;

        let tmp_dir = self.path.join("tmp");
        let (name, tmppath, mut file) = loop {
            let name = self.names.generate();
            let tmppath = tmp_dir.join(&name);

            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            if let Some(mode) = self.file_mode {
                options.mode(mode);
            }

            match options.open(&tmppath).await {
                Ok(file) => break (name, tmppath, file),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // A stale file from a previous process; pick the next name
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        };

        // Ensure that we remove the temporary file on failure
        let mut unlink_guard = UnlinkOnError {
            path_to_unlink: Some(tmppath.clone()),
        };

        tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let newpath = self.path.join("new").join(&name);
        tokio::fs::rename(&tmppath, &newpath).await?;
        unlink_guard.path_to_unlink.take();

        tracing::trace!("appended {}", newpath.display());
        Ok(name)
    }

    /// Lists the message files in `cur` followed by those in `new`,
    /// ordered by file name. Files starting with a '.' are skipped.
    pub fn list_paths(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut result = vec![];
        for sub in ["cur", "new"] {
            let dir = self.path.join(sub);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            for entry in entries {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if entry.file_type()?.is_file() {
                    result.push(entry.path());
                }
            }
        }
        result.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(result)
    }
}

/// The unique portion of a message file name: everything before
/// the informational suffix
pub fn unique_name(file_name: &str) -> &str {
    file_name
        .split(INFORMATIONAL_SUFFIX_SEPARATOR)
        .next()
        .unwrap_or(file_name)
}

/// Creates the maildir structure, including `.Trash`, rooted at `path`.
pub fn initialize_maildir<P: Into<PathBuf>>(path: P) -> std::io::Result<()> {
    Maildir::with_path(path).initialize()
}

/// At this point, the message file is at `path_to_unlink`.
/// If we leave the scope of the append prior to successfully
/// renaming the file to its final location, we need to ensure
/// that we remove the temporary file.
struct UnlinkOnError {
    path_to_unlink: Option<PathBuf>,
}

impl Drop for UnlinkOnError {
    fn drop(&mut self) {
        if let Some(path) = self.path_to_unlink.take() {
            // Best effort to remove it
            std::fs::remove_file(path).ok();
        }
    }
}

#[cfg(unix)]
fn chmod(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, mode)
}
