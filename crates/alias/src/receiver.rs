use crate::DeliveryError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

/// Accepts a message one line at a time.
#[async_trait]
pub trait MessageReceiver: Send {
    /// One line of the message, without its terminator
    async fn line_received(&mut self, line: &[u8]) -> Result<(), DeliveryError>;

    /// The message is complete.
    /// The returned future is constructed before this returns, so any
    /// completion deadline is measured from this call.
    fn eom_received(&mut self) -> BoxFuture<'static, Result<(), DeliveryError>>;

    /// The message will not be completed; discard anything staged
    fn connection_lost(&mut self);
}

/// Appends the message to a file.
///
/// Lines are staged in an anonymous temporary file, and only copied
/// to the target once the message is complete, so an abandoned message
/// never leaves a fragment in the target.
pub struct FileReceiver {
    target: PathBuf,
    staged: Option<BufWriter<tokio::fs::File>>,
}

impl FileReceiver {
    pub fn new<P: Into<PathBuf>>(target: P) -> Result<Self, DeliveryError> {
        let staged = tempfile::tempfile()
            .map_err(DeliveryError::io("failed to create staging file"))?;
        Ok(Self {
            target: target.into(),
            staged: Some(BufWriter::new(tokio::fs::File::from_std(staged))),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[async_trait]
impl MessageReceiver for FileReceiver {
    async fn line_received(&mut self, line: &[u8]) -> Result<(), DeliveryError> {
        let staged = self
            .staged
            .as_mut()
            .ok_or(DeliveryError::AlreadyComplete)?;
        staged
            .write_all(line)
            .await
            .map_err(DeliveryError::io("failed to stage message"))?;
        staged
            .write_all(b"\n")
            .await
            .map_err(DeliveryError::io("failed to stage message"))
    }

    fn eom_received(&mut self) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let Some(mut staged) = self.staged.take() else {
            return futures::future::ready(Err(DeliveryError::AlreadyComplete)).boxed();
        };
        let target = self.target.clone();

        async move {
            staged
                .flush()
                .await
                .map_err(DeliveryError::io("failed to stage message"))?;
            let mut staged = staged.into_inner();
            staged
                .rewind()
                .await
                .map_err(DeliveryError::io("failed to rewind staged message"))?;

            let context = format!("failed to append to {}", target.display());
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await
                .map_err(DeliveryError::io(context.clone()))?;
            tokio::io::copy(&mut staged, &mut file)
                .await
                .map_err(DeliveryError::io(context.clone()))?;
            file.sync_all()
                .await
                .map_err(DeliveryError::io(context))?;

            tracing::debug!("appended message to {}", target.display());
            Ok(())
        }
        .boxed()
    }

    fn connection_lost(&mut self) {
        self.staged.take();
    }
}

struct Slot {
    receiver: Box<dyn MessageReceiver>,
    failed: Option<DeliveryError>,
}

/// Delivers the same message to several receivers.
///
/// A receiver that fails stops receiving lines, but never prevents
/// its siblings from completing.
pub struct MultiReceiver {
    slots: Vec<Slot>,
}

impl MultiReceiver {
    pub fn new(receivers: Vec<Box<dyn MessageReceiver>>) -> Self {
        Self {
            slots: receivers
                .into_iter()
                .map(|receiver| Slot {
                    receiver,
                    failed: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl MessageReceiver for MultiReceiver {
    async fn line_received(&mut self, line: &[u8]) -> Result<(), DeliveryError> {
        for slot in &mut self.slots {
            if slot.failed.is_some() {
                continue;
            }
            if let Err(err) = slot.receiver.line_received(line).await {
                tracing::debug!("receiver failed mid-message: {err:#}");
                slot.failed.replace(err);
            }
        }
        Ok(())
    }

    fn eom_received(&mut self) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let mut failures = vec![];
        let mut pending = vec![];
        for slot in &mut self.slots {
            match slot.failed.take() {
                Some(err) => {
                    slot.receiver.connection_lost();
                    failures.push(err);
                }
                None => pending.push(slot.receiver.eom_received()),
            }
        }

        async move {
            let results = futures::future::join_all(pending).await;
            failures.extend(results.into_iter().filter_map(Result::err));
            if failures.is_empty() {
                Ok(())
            } else {
                Err(DeliveryError::Partial(failures))
            }
        }
        .boxed()
    }

    fn connection_lost(&mut self) {
        for slot in &mut self.slots {
            slot.receiver.connection_lost();
        }
    }
}
