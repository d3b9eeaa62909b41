use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{LineSource, MemorySource};

/// Buffer between the tail process and the pump
pub const DEFAULT_FEED_BUFFER: usize = 4096;

/// Most lines appended to the store per growth event
pub const MAX_APPEND_BATCH: usize = 1024;

/// Events produced by a log feed
#[derive(Debug, PartialEq, Eq)]
pub enum FeedEvent {
    Line(String),
    /// The file shrank; everything read so far is gone
    Truncated,
    /// The file disappeared or cannot be read
    Unavailable,
    /// A (possibly new) file is being followed again
    Reappeared,
    Error(String),
    EndOfStream,
}

/// Something that streams raw lines plus rotation notices
#[async_trait::async_trait]
pub trait LogFeed: Send + Sync {
    /// Start streaming feed events
    async fn stream(&self) -> mpsc::Receiver<FeedEvent>;

    /// Get the display name for this feed
    fn name(&self) -> String;
}

/// A feed that follows a file using `tail -F`, from the first line on.
///
/// Lines arrive on tail's stdout and rotation notices on its stderr. The two
/// pipes are not ordered relative to each other: lines written right after a
/// truncation can reach the feed before the `Truncated` notice, and the
/// rollover that follows then drops them along with the old content.
/// `forward_output` prefers stderr whenever both pipes are readable, which
/// closes the gap for everything already buffered when the notice lands.
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

/// Map a diagnostic printed by `tail -F` to a feed event
pub fn classify_tail_notice(line: &str) -> FeedEvent {
    if line.contains("file truncated") {
        FeedEvent::Truncated
    } else if line.contains("has become inaccessible") || line.contains("cannot open") {
        FeedEvent::Unavailable
    } else if line.contains("has appeared") || line.contains("has been replaced") {
        FeedEvent::Reappeared
    } else {
        FeedEvent::Error(line.to_string())
    }
}

#[async_trait::async_trait]
impl LogFeed for FileFeed {
    async fn stream(&self) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(DEFAULT_FEED_BUFFER);
        let path = self.path.clone();

        tokio::spawn(async move {
            let result = Command::new("tail")
                .arg("-F")
                .arg("-n")
                .arg("+1")
                .arg(&path)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            match result {
                Ok(mut child) => {
                    if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
                        forward_output(BufReader::new(stdout), BufReader::new(stderr), &tx).await;
                    }

                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            let _ = tx
                                .send(FeedEvent::Error(format!(
                                    "tail exited with status: {}",
                                    status
                                )))
                                .await;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(FeedEvent::Error(format!("Error waiting for tail: {}", e)))
                                .await;
                        }
                        _ => {}
                    }

                    let _ = tx.send(FeedEvent::EndOfStream).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(FeedEvent::Error(format!("Failed to spawn tail: {}", e)))
                        .await;
                    let _ = tx.send(FeedEvent::EndOfStream).await;
                }
            }
        });

        rx
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Forward tail's output until both pipes close.
///
/// Pending notices on `stderr` go out before pending lines on `stdout`.
pub async fn forward_output<O, E>(stdout: O, stderr: E, tx: &mpsc::Sender<FeedEvent>)
where
    O: AsyncBufRead + Unpin,
    E: AsyncBufRead + Unpin,
{
    let mut lines = stdout.lines();
    let mut notices = stderr.lines();
    let (mut lines_open, mut notices_open) = (true, true);
    while lines_open || notices_open {
        let event = tokio::select! {
            biased;
            notice = notices.next_line(), if notices_open => match notice {
                Ok(Some(notice)) => classify_tail_notice(&notice),
                _ => {
                    notices_open = false;
                    continue;
                }
            },
            line = lines.next_line(), if lines_open => match line {
                Ok(Some(line)) => FeedEvent::Line(line),
                _ => {
                    lines_open = false;
                    continue;
                }
            },
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Apply feed events to an in-memory source until the feed ends.
///
/// Consecutive lines are batched so a burst produces one growth event.
pub async fn pump_into(mut rx: mpsc::Receiver<FeedEvent>, source: Arc<MemorySource>) {
    let mut batch: Vec<String> = Vec::new();
    while let Some(event) = rx.recv().await {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            match event {
                FeedEvent::Line(line) => {
                    batch.push(line);
                    if batch.len() < MAX_APPEND_BATCH {
                        next = rx.try_recv().ok();
                    }
                    if next.as_ref().is_some_and(|e| matches!(e, FeedEvent::Line(_))) {
                        continue;
                    }
                    flush(&source, &mut batch);
                }
                FeedEvent::Truncated => {
                    flush(&source, &mut batch);
                    info!(source = %source.name(), "File truncated, rolling over");
                    source.rollover(source.line_count(), std::iter::empty::<String>());
                }
                FeedEvent::Unavailable => {
                    flush(&source, &mut batch);
                    warn!(source = %source.name(), "File became unavailable");
                    source.mark_lost();
                }
                FeedEvent::Reappeared => {
                    flush(&source, &mut batch);
                    info!(source = %source.name(), "File reappeared");
                    if source.is_lost() {
                        source.restart(std::iter::empty::<String>());
                    } else {
                        source.rollover(source.line_count(), std::iter::empty::<String>());
                    }
                }
                FeedEvent::Error(msg) => {
                    warn!(source = %source.name(), error = %msg, "Feed error");
                }
                FeedEvent::EndOfStream => {
                    flush(&source, &mut batch);
                    debug!(source = %source.name(), "Feed ended");
                    return;
                }
            }
        }
    }
    flush(&source, &mut batch);
}

fn flush(source: &MemorySource, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = source.append_lines(batch.drain(..)) {
        warn!(source = %source.name(), error = %e, "Dropping lines for closed source");
    }
}
