use std::io;
use std::time::Duration;

use filigree_protocol::{decode_line, Command};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::time::Instant;

const CHUNK_SIZE: usize = 256;
/// Longest line we'll buffer. Anything longer is noise and gets dropped whole.
pub const MAX_LINE_LEN: usize = 4096;

/// Turns a byte stream into one decoded [`Command`] at a time.
///
/// Partial lines stay buffered between calls, so a line split across several
/// reads (or several timed-out attempts) is never lost.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    closed: bool,
    /// Dropping the rest of an overlong line.
    skipping: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(CHUNK_SIZE),
            closed: false,
            skipping: false,
        }
    }

    /// True once the stream has reported end-of-file.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received but not yet part of a complete line.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Waits up to `timeout` for a complete line and decodes it.
    ///
    /// Returns `Ok(None)` if no full line showed up in time, if the stream
    /// ended, or if the line wasn't a usable command (device comments and
    /// garbage are logged and skipped). Only I/O failures are errors.
    pub async fn read_command(&mut self, timeout: Duration) -> io::Result<Option<Command>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_line() {
                return Ok(decode(&line));
            }
            if self.closed {
                return Ok(None);
            }

            let mut chunk = [0u8; CHUNK_SIZE];
            // `read` is cancel-safe, so timing out here never drops bytes.
            let n = match tokio::time::timeout_at(deadline, self.inner.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(res) => res?,
            };
            if n == 0 {
                self.closed = true;
            } else {
                self.push(&chunk[..n]);
            }
        }
    }

    fn push(&mut self, mut bytes: &[u8]) {
        if self.skipping {
            let Some(end) = bytes.iter().position(|&b| b == b'\n') else {
                return;
            };
            self.skipping = false;
            bytes = &bytes[end + 1..];
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
            log::warn!("dropping a line longer than {MAX_LINE_LEN} bytes");
            self.buf.clear();
            self.skipping = true;
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }
}

fn decode(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(comment) = line.strip_prefix('#') {
        log::debug!("device: {}", comment.trim());
        return None;
    }
    match decode_line(line) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            log::warn!("skipping unreadable line: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    const TIMEOUT: Duration = Duration::from_millis(20);

    #[tokio::test(start_paused = true)]
    async fn keeps_partial_lines_across_timeouts() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = LineReader::new(host);

        device.write_all(b"5,0,1").await.unwrap();
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        assert_eq!(reader.pending(), b"5,0,1");

        device.write_all(b",0,0\n").await.unwrap();
        let cmd = reader.read_command(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(cmd.request_id, 5);
        assert_eq!(cmd.controller_id, 1);
        assert!(reader.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_command_per_call() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = LineReader::new(host);

        device.write_all(b"1,0,0,0,0\n2,0,0,0,0\n3,0").await.unwrap();
        let first = reader.read_command(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(reader.pending(), b"2,0,0,0,0\n3,0");
        let second = reader.read_command(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(second.request_id, 2);
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        assert_eq!(reader.pending(), b"3,0");
    }

    #[tokio::test(start_paused = true)]
    async fn comments_and_garbage_are_skipped() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = LineReader::new(host);

        device
            .write_all(b"# booting\r\nnot a number\n7,0,2,0,0\r\n")
            .await
            .unwrap();
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        let cmd = reader.read_command(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(cmd.request_id, 7);
        assert_eq!(cmd.controller_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlong_lines_are_dropped_whole() {
        let (mut device, host) = tokio::io::duplex(2 * MAX_LINE_LEN);
        let mut reader = LineReader::new(host);

        device.write_all(&[b'7'; MAX_LINE_LEN + 900]).await.unwrap();
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        assert!(reader.pending().len() <= MAX_LINE_LEN);

        device.write_all(b"1,0,0,0,0\n4,0,1,0,0\n").await.unwrap();
        let cmd = reader.read_command(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(cmd.request_id, 4);
        assert_eq!(cmd.controller_id, 1);
        assert!(reader.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_keeps_the_partial_line() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = LineReader::new(host);

        device.write_all(b"9,0").await.unwrap();
        drop(device);
        assert_eq!(reader.read_command(TIMEOUT).await.unwrap(), None);
        assert!(reader.is_closed());
        assert_eq!(reader.pending(), b"9,0");
    }
}
