use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::watch;

pub const DEFAULT_TRANSCRIPT_CAP: usize = 8 * 1024 * 1024;

#[derive(Debug, Default)]
struct LogState {
    /// Absolute offset of `data[0]`.
    base: u64,
    data: VecDeque<u8>,
    closed: bool,
}

/// Append-only transcript of one process with any number of independent
/// readers. Offsets are absolute byte positions since the process started and
/// stay valid after the retained window is trimmed.
#[derive(Debug)]
pub struct OutputLog {
    state: StdMutex<LogState>,
    cap: usize,
    notify: watch::Sender<u64>,
}

impl OutputLog {
    pub fn new(cap: usize) -> Arc<Self> {
        let (notify, _) = watch::channel(0);
        Arc::new(Self {
            state: StdMutex::new(LogState::default()),
            cap: cap.max(1),
            notify,
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let keep = bytes.len().min(self.cap);
            let skipped = bytes.len() - keep;
            let excess = (state.data.len() + keep).saturating_sub(self.cap);
            state.data.drain(..excess);
            state.data.extend(&bytes[skipped..]);
            state.base += (excess + skipped) as u64;
            state.base + state.data.len() as u64
        };
        self.notify.send_replace(end);
    }

    /// Marks the end of output. Later appends are ignored and readers finish
    /// once they have consumed the retained bytes.
    pub fn close(&self) {
        let end = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.base + state.data.len() as u64
        };
        self.notify.send_replace(end);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total bytes ever written.
    pub fn total_bytes(&self) -> u64 {
        let state = self.lock();
        state.base + state.data.len() as u64
    }

    pub fn retained_start(&self) -> u64 {
        self.lock().base
    }

    /// Bytes from `offset` to the current end. Offsets before the retained
    /// window are clamped to its start; the returned offset is where the
    /// bytes actually begin.
    pub fn read_from(&self, offset: u64) -> (u64, Vec<u8>, bool) {
        let state = self.lock();
        let end = state.base + state.data.len() as u64;
        let start = offset.clamp(state.base, end);
        let index = (start - state.base) as usize;
        (start, state.data.range(index..).copied().collect(), state.closed)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.iter().copied().collect()
    }

    pub fn reader(self: &Arc<Self>, from: u64) -> LogReader {
        LogReader {
            log: self.clone(),
            cursor: from,
            changes: self.notify.subscribe(),
        }
    }
}

pub struct LogReader {
    log: Arc<OutputLog>,
    cursor: u64,
    changes: watch::Receiver<u64>,
}

impl LogReader {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next batch of bytes past the cursor, waiting for the writer when caught
    /// up. `None` once the log is closed and fully consumed.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            self.changes.borrow_and_update();
            let (start, bytes, closed) = self.log.read_from(self.cursor);
            if !bytes.is_empty() {
                self.cursor = start + bytes.len() as u64;
                return Some(bytes);
            }
            if closed {
                return None;
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        stream::unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Some((chunk, reader))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn late_reader_receives_full_transcript_then_live_bytes() {
        let log = OutputLog::new(DEFAULT_TRANSCRIPT_CAP);
        log.append(b"hello ");
        let mut early = log.reader(0);
        assert_eq!(early.next_chunk().await.unwrap(), b"hello ");

        log.append(b"world");
        let late = log.reader(0);

        let writer = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b"!");
            writer.close();
        });

        let collected: Vec<u8> = late.into_stream().concat().await;
        assert_eq!(collected, b"hello world!");
        assert_eq!(early.next_chunk().await.unwrap(), b"world!");
        assert_eq!(early.next_chunk().await, None);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reader_resumes_from_offset() {
        let log = OutputLog::new(DEFAULT_TRANSCRIPT_CAP);
        log.append(b"0123456789");
        log.close();
        let mut reader = log.reader(4);
        assert_eq!(reader.next_chunk().await.unwrap(), b"456789");
        assert_eq!(reader.cursor(), 10);
        assert_eq!(reader.next_chunk().await, None);
    }

    #[test]
    fn cap_trims_front_and_keeps_absolute_offsets() {
        let log = OutputLog::new(4);
        log.append(b"abcdef");
        assert_eq!(log.total_bytes(), 6);
        assert_eq!(log.retained_start(), 2);
        assert_eq!(log.snapshot(), b"cdef");

        let (start, bytes, _) = log.read_from(0);
        assert_eq!(start, 2);
        assert_eq!(bytes, b"cdef");
        let (start, bytes, _) = log.read_from(5);
        assert_eq!((start, bytes.as_slice()), (5, &b"f"[..]));
    }

    #[test]
    fn chunks_larger_than_the_cap_keep_only_their_tail() {
        let log = OutputLog::new(4);
        log.append(b"ab");
        log.append(b"0123456789");
        assert_eq!(log.total_bytes(), 12);
        assert_eq!(log.retained_start(), 8);
        assert_eq!(log.snapshot(), b"6789");

        log.append(b"xy");
        assert_eq!(log.retained_start(), 10);
        assert_eq!(log.snapshot(), b"89xy");
        let (start, bytes, _) = log.read_from(11);
        assert_eq!((start, bytes.as_slice()), (11, &b"9xy"[..]));
    }

    #[test]
    fn appends_after_close_are_ignored() {
        let log = OutputLog::new(16);
        log.append(b"done");
        log.close();
        log.append(b"late");
        assert!(log.is_closed());
        assert_eq!(log.snapshot(), b"done");
    }
}
