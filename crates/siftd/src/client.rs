//! The outbound half of a proxied session: the side that speaks to the
//! upstream SMTP server.
//!
//! Replies are assembled whole, continuation lines included, so the relay
//! loop always forwards exactly one upstream reply per inbound command.
//! The body writer applies dot-stuffing on the way out and finishes with
//! the bare `.` terminator.

use anyhow::Context;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tracing::trace;

use crate::spool::BodySpool;
use smtp_wire::{find_crlf, split_line_ending, stuff_line, Reply, ReplyBuilder};

const READ_CHUNK: usize = 4096;

pub struct ClientSession<T> {
    reader: ReadHalf<T>,
    writer: BufWriter<WriteHalf<T>>,
    read_buffer: Vec<u8>,
}

impl ClientSession<TcpStream> {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting upstream {addr}"))?;
        Ok(Self::new(stream))
    }
}

impl<T: AsyncRead + AsyncWrite> ClientSession<T> {
    pub fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: BufWriter::new(writer),
            read_buffer: Vec::new(),
        }
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        loop {
            if let Some(i) = find_crlf(&self.read_buffer) {
                let line = String::from_utf8(self.read_buffer[0..i].to_vec())
                    .context("upstream reply is not UTF-8")?;
                self.read_buffer.drain(0..i + 2);
                return Ok(line);
            }

            // No complete line buffered yet; pull in the next chunk.
            let mut data = [0u8; READ_CHUNK];
            let size = self
                .reader
                .read(&mut data)
                .await
                .context("reading upstream reply")?;
            if size == 0 {
                anyhow::bail!("connection closed by upstream");
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    /// Reads one complete reply, following `xyz-` continuation lines to
    /// the final `xyz ` line.
    pub async fn read_reply(&mut self) -> anyhow::Result<Reply> {
        self.writer.flush().await.context("flushing upstream send")?;

        let mut builder = ReplyBuilder::new();
        loop {
            let line = self.read_line().await?;
            trace!("recv<-upstream: {line}");
            if builder.add_line(&line)? {
                break;
            }
        }
        Ok(builder.build()?)
    }

    /// Writes one command line verbatim plus CRLF.
    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        trace!("send->upstream: {line}");
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("writing upstream command")?;
        self.writer
            .write_all(b"\r\n")
            .await
            .context("writing upstream command")?;
        self.writer.flush().await.context("flushing upstream send")?;
        Ok(())
    }

    /// Streams the body as the DATA payload: each stored line goes out
    /// dot-stuffed with a CRLF terminator, then the final `.` line.
    pub async fn send_body(&mut self, mut body: BodySpool) -> anyhow::Result<()> {
        body.rewind().await.context("rewinding body spool")?;
        trace!("send->upstream: {} body bytes", body.len());

        let mut reader = tokio::io::BufReader::new(body.into_file());
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = reader
                .read_until(b'\n', &mut raw)
                .await
                .context("reading body spool")?;
            if n == 0 {
                break;
            }
            let (content, _ending) = split_line_ending(&raw);
            self.writer
                .write_all(&stuff_line(content))
                .await
                .context("writing body line")?;
            self.writer
                .write_all(b"\r\n")
                .await
                .context("writing body line")?;
        }

        self.writer
            .write_all(b".\r\n")
            .await
            .context("terminating body")?;
        self.writer.flush().await.context("flushing body")?;
        Ok(())
    }
}
