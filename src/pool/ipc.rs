//! Buffered line IPC over async pipes.
//!
//! Both ends of the worker protocol speak newline-delimited messages; these
//! wrappers hide the buffering and the encode/decode step.

use super::protocol::Message;
use crate::error::{PoolError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

/// Default buffer size for IPC (64KB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Line reader decoding one protocol message per line.
///
/// `recv` is cancel-safe: a line is never half-consumed when the future is dropped.
#[derive(Debug)]
pub struct LineReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Read a raw line with any trailing `\r` stripped. `None` on EOF.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        match self.lines.next_line().await? {
            Some(mut line) => {
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Receive and decode the next message, skipping blank lines. `None` on EOF.
    pub async fn recv<M: Message>(&mut self) -> Result<Option<M>> {
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return M::from_line(&line)
                .map(Some)
                .map_err(|e| PoolError::Protocol(format!("invalid message {:?}: {}", line, e)));
        }
    }
}

/// Line writer encoding one protocol message per line.
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a line (appends newline if not present) and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Encode and send one message.
    pub async fn send<M: Message>(&mut self, message: &M) -> Result<()> {
        self.write_line(&message.to_line()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::protocol::WorkerMessage;
    use tokio::io::{BufReader, duplex};

    #[tokio::test]
    async fn test_line_reader_writer_roundtrip() {
        let (client, server) = duplex(1024);
        let mut writer = LineWriter::new(client);
        let mut reader = LineReader::new(BufReader::new(server));

        writer.write_line("hello").await.unwrap();
        writer.write_line("world\n").await.unwrap();
        writer.write_line("").await.unwrap();
        drop(writer);

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("world"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_crlf_handling() {
        let (mut client, server) = duplex(1024);
        let mut reader = LineReader::new(BufReader::new(server));

        client.write_all(b"line1\r\nline2\n").await.unwrap();
        drop(client);

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line1"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("line2"));
    }

    #[tokio::test]
    async fn test_message_send_recv_skips_blank_lines() {
        let (client, server) = duplex(1024);
        let mut writer = LineWriter::new(client);
        let mut reader = LineReader::new(BufReader::new(server));

        writer.write_line("").await.unwrap();
        writer.send(&WorkerMessage::Ready).await.unwrap();
        drop(writer);

        let msg: Option<WorkerMessage> = reader.recv().await.unwrap();
        assert_eq!(msg, Some(WorkerMessage::Ready));
        let eof: Option<WorkerMessage> = reader.recv().await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        let (client, server) = duplex(1024);
        let mut writer = LineWriter::new(client);
        let mut reader = LineReader::new(BufReader::new(server));

        writer.write_line("not json").await.unwrap();
        let result: Result<Option<WorkerMessage>> = reader.recv().await;
        assert!(matches!(result, Err(PoolError::Protocol(_))));
    }
}
