//! Line streams from the backend: its stdout or its log file
//!
//! Both sources end up as an `mpsc::Receiver<String>` that the readiness
//! watcher consumes. Every line is also re-emitted through `tracing` under
//! the `backend` target.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// How often the log file is checked for new content
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const LINE_BUFFER: usize = 256;

/// Forward lines read from `reader`.
///
/// Reading continues after the receiver is dropped so a pipe never fills up
/// and blocks the process writing to it.
pub fn lines_from_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    debug!(target: "backend", "{}", line);
                    if !tx.is_closed() {
                        let _ = tx.send(line).await;
                    }
                }
                Ok(None) => break,
                // A terminal reports EIO once the other side is gone
                Err(e) => {
                    trace!(error = %e, "Output stream ended");
                    break;
                }
            }
        }
    });
    rx
}

/// A receiver that yields nothing and is already closed
pub fn empty() -> mpsc::Receiver<String> {
    let (_, rx) = mpsc::channel(1);
    rx
}

/// Follow a log file from its current end.
///
/// The file may not exist yet. If it shrinks (rotation at backend startup)
/// reading restarts from the beginning. The task ends when the receiver is
/// dropped.
pub fn tail_file(path: PathBuf, poll_interval: Duration) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut position = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut partial = String::new();
        debug!(path = %path.display(), position, "Tailing backend log");

        while !tx.is_closed() {
            tokio::time::sleep(poll_interval).await;

            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if len < position {
                debug!(path = %path.display(), "Log file truncated, reading from start");
                position = 0;
                partial.clear();
            }
            if len == position {
                continue;
            }

            let chunk = match read_from(&path, position).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    trace!(error = %e, "Failed to read log file");
                    continue;
                }
            };
            position += chunk.len() as u64;
            partial.push_str(&String::from_utf8_lossy(&chunk));

            for line in split_complete_lines(&mut partial) {
                debug!(target: "backend", "{}", line);
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

async fn read_from(path: &Path, position: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(position)).await?;
    let mut chunk = Vec::new();
    file.read_to_end(&mut chunk).await?;
    Ok(chunk)
}

/// Drain every newline-terminated line from `buffer`, leaving any trailing fragment
fn split_complete_lines(buffer: &mut String) -> Vec<String> {
    let Some(last_newline) = buffer.rfind('\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);
    complete
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}
