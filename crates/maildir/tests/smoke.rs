use maildir::*;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;

async fn populated(count: usize) -> anyhow::Result<(tempfile::TempDir, Arc<Maildir>)> {
    let dir = tempdir()?;
    let maildir = Arc::new(Maildir::with_path(dir.path().join("alice")));
    maildir.initialize()?;
    for i in 0..count {
        maildir
            .append_message(format!("message {i}\n").as_bytes())
            .await?;
    }
    Ok((dir, maildir))
}

#[tokio::test]
async fn concurrent_appends_are_distinct_and_ordered() -> anyhow::Result<()> {
    let (_dir, maildir) = populated(0).await?;

    let appends = (0..25).map(|i| {
        let maildir = maildir.clone();
        async move { maildir.append_message(format!("{i}").as_bytes()).await }
    });
    let names = futures::future::try_join_all(appends).await?;

    let unique: HashSet<&String> = names.iter().collect();
    assert_eq!(unique.len(), 25);

    let mut sorted = names.clone();
    sorted.sort();
    let mailbox = MaildirMailbox::open(maildir.clone())?;
    assert_eq!(mailbox.list_messages().len(), 25);

    // Listing order is name order, which is generation order
    let listed: Vec<String> = maildir
        .list_paths()?
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    k9::assert_equal!(listed, sorted);
    Ok(())
}

#[tokio::test]
async fn lists_cur_and_new() -> anyhow::Result<()> {
    let (dir, maildir) = populated(3).await?;

    // Move the first message into cur, as a mail reader would
    let first = maildir.list_paths()?[0].clone();
    let name = first.file_name().unwrap().to_string_lossy().to_string();
    std::fs::rename(
        &first,
        dir.path().join("alice/cur").join(format!("{name}:2,S")),
    )?;

    let mailbox = MaildirMailbox::open(maildir)?;
    assert_eq!(mailbox.list_messages(), vec![10, 10, 10]);

    let mut text = String::new();
    mailbox
        .get_message(0)
        .await?
        .read_to_string(&mut text)
        .await?;
    assert_eq!(text, "message 0\n");
    Ok(())
}

#[tokio::test]
async fn snapshot_is_stable_until_refresh() -> anyhow::Result<()> {
    let (_dir, maildir) = populated(2).await?;
    let mut mailbox = MaildirMailbox::open(maildir.clone())?;

    maildir.append_message(b"late arrival\n").await?;
    assert_eq!(mailbox.list_messages().len(), 2);

    mailbox.refresh()?;
    assert_eq!(mailbox.list_messages().len(), 3);
    Ok(())
}

#[tokio::test]
async fn uidl_survives_reopen_and_flags() -> anyhow::Result<()> {
    let (dir, maildir) = populated(2).await?;
    let mailbox = MaildirMailbox::open(maildir.clone())?;
    let before = [mailbox.get_uidl(0)?, mailbox.get_uidl(1)?];
    assert_ne!(before[0], before[1]);

    // Moving to cur with an info suffix doesn't change the uidl
    for path in maildir.list_paths()? {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        std::fs::rename(&path, dir.path().join("alice/cur").join(format!("{name}:2,S")))?;
    }

    let reopened = MaildirMailbox::open(maildir)?;
    let after = [reopened.get_uidl(0)?, reopened.get_uidl(1)?];
    k9::assert_equal!(before, after);
    Ok(())
}

#[tokio::test]
async fn delete_then_undelete_restores() -> anyhow::Result<()> {
    let (_dir, maildir) = populated(3).await?;
    let mut mailbox = MaildirMailbox::open(maildir.clone())?;

    mailbox.delete_message(1)?;
    assert_eq!(mailbox.message_size(1)?, 0);
    assert_eq!(mailbox.list_messages(), vec![10, 0, 10]);
    assert!(matches!(
        mailbox.get_message(1).await,
        Err(MaildirError::Deleted(1))
    ));

    mailbox.undelete_messages();
    assert_eq!(mailbox.list_messages(), vec![10, 10, 10]);
    assert_eq!(maildir.list_paths()?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn delete_sync_undelete_is_permanent() -> anyhow::Result<()> {
    let (dir, maildir) = populated(3).await?;
    let mut mailbox = MaildirMailbox::open(maildir.clone())?;
    let doomed = maildir.list_paths()?[1].clone();

    mailbox.delete_message(1)?;
    // Still on disk until sync
    assert!(doomed.exists());

    mailbox.sync().await?;
    mailbox.undelete_messages();

    assert_eq!(mailbox.list_messages(), vec![10, 0, 10]);
    assert!(!doomed.exists());
    let trashed = dir
        .path()
        .join("alice/.Trash/cur")
        .join(doomed.file_name().unwrap());
    assert!(trashed.exists());
    assert_eq!(maildir.list_paths()?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn out_of_range() -> anyhow::Result<()> {
    let (_dir, maildir) = populated(1).await?;
    let mut mailbox = MaildirMailbox::open(maildir)?;
    assert!(matches!(
        mailbox.delete_message(5),
        Err(MaildirError::IndexOutOfRange(5))
    ));
    assert!(mailbox.get_uidl(1).is_err());
    Ok(())
}
