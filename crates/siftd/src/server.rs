//! The inbound half of a proxied session: the side that speaks to the
//! SMTP client we accepted.
//!
//! The session reads commands and hands them to the relay loop verbatim.
//! The one place it acts on its own is DATA: the 354 go-ahead is
//! synthesized locally and the body is captured (dot-unstuffed, CRLF
//! normalized) into a [`BodySpool`] before the relay loop hears about it.

use anyhow::Context;
use std::path::PathBuf;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tracing::debug;

use crate::spool::BodySpool;
use crate::trace::TraceSink;
use smtp_wire::{envelope_address, split_line_ending, trim_line_ending, unstuff_line, Reply, Verb};

/// What the relay loop sees for each protocol step on the inbound side.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command line, stripped of its terminator, to be forwarded
    /// verbatim.
    Command(String),
    /// The DATA payload has been captured; the body spool is ready for
    /// filtering and upstream delivery.
    BodyReady,
}

#[derive(Debug, Default)]
struct Transaction {
    sender: Option<String>,
    recipients: Vec<String>,
    body: Option<BodySpool>,
}

pub struct ServerSession<'t, T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    trace: Option<&'t mut TraceSink>,
    txn: Transaction,
    quit_seen: bool,
}

impl<'t, T: AsyncRead + AsyncWrite> ServerSession<'t, T> {
    pub fn new(stream: T, trace: Option<&'t mut TraceSink>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            trace,
            txn: Transaction::default(),
            quit_seen: false,
        }
    }

    pub fn trace_path(&self) -> Option<PathBuf> {
        self.trace.as_ref().map(|sink| sink.path().to_path_buf())
    }

    /// Writes one complete reply line, terminator included, and flushes.
    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.write_line(line).await?;
        self.writer.flush().await.context("flushing inbound reply")?;
        Ok(())
    }

    /// Relays a (possibly multi-line) upstream reply byte for byte.
    pub async fn relay_reply(&mut self, reply: &Reply) -> anyhow::Result<()> {
        for line in &reply.lines {
            self.write_line(line).await?;
        }
        self.writer.flush().await.context("flushing inbound reply")?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("writing inbound reply")?;
        self.writer
            .write_all(b"\r\n")
            .await
            .context("writing inbound reply")?;
        if let Some(sink) = self.trace.as_deref_mut() {
            sink.record(line.as_bytes());
            sink.record(b"\r\n");
        }
        Ok(())
    }

    /// Returns the next protocol step, or None once the dialogue is over
    /// (client closed, or QUIT's reply has been relayed).
    pub async fn next_event(&mut self) -> anyhow::Result<Option<SessionEvent>> {
        if self.quit_seen {
            return Ok(None);
        }

        let mut raw = String::new();
        let n = self
            .reader
            .read_line(&mut raw)
            .await
            .context("reading inbound command")?;
        if n == 0 {
            return Ok(None);
        }
        if !raw.ends_with('\n') {
            anyhow::bail!("connection closed mid-command");
        }
        if let Some(sink) = self.trace.as_deref_mut() {
            sink.record(raw.as_bytes());
        }

        let line = trim_line_ending(&raw).to_string();
        debug!("inbound command: {line}");

        match Verb::classify(&line) {
            Verb::Data => {
                self.send_line("354 End data with <CR><LF>.<CR><LF>")
                    .await?;
                self.capture_body().await?;
                Ok(Some(SessionEvent::BodyReady))
            }
            Verb::Rset => {
                self.txn = Transaction::default();
                Ok(Some(SessionEvent::Command(line)))
            }
            Verb::Mail => {
                // A second MAIL FROM starts a new transaction; the previous
                // body spool is released here.
                self.txn = Transaction::default();
                self.txn.sender = envelope_address(&line).map(str::to_string);
                debug!("envelope sender: {:?}", self.txn.sender);
                Ok(Some(SessionEvent::Command(line)))
            }
            Verb::Rcpt => {
                if let Some(rcpt) = envelope_address(&line) {
                    self.txn.recipients.push(rcpt.to_string());
                    debug!(
                        "envelope recipient {} of {:?}",
                        self.txn.recipients.len(),
                        self.txn.sender
                    );
                }
                Ok(Some(SessionEvent::Command(line)))
            }
            Verb::Quit => {
                self.quit_seen = true;
                Ok(Some(SessionEvent::Command(line)))
            }
            Verb::Helo | Verb::Ehlo | Verb::Other => Ok(Some(SessionEvent::Command(line))),
        }
    }

    async fn capture_body(&mut self) -> anyhow::Result<()> {
        let mut spool = BodySpool::create().context("creating body spool")?;
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut raw)
                .await
                .context("reading message body")?;
            if n == 0 || !raw.ends_with(b"\n") {
                anyhow::bail!("connection closed inside the message body");
            }
            if let Some(sink) = self.trace.as_deref_mut() {
                sink.record(&raw);
            }
            let (content, _ending) = split_line_ending(&raw);
            if content == b"." {
                break;
            }
            spool
                .append_line(unstuff_line(content))
                .await
                .context("spooling body line")?;
        }
        debug!("captured {} body bytes", spool.len());
        self.txn.body = Some(spool);
        Ok(())
    }

    /// Hands the captured body to the relay loop; the transaction no
    /// longer references it afterwards.
    pub fn take_body(&mut self) -> Option<BodySpool> {
        self.txn.body.take()
    }
}
