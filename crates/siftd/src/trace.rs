//! Per-worker debug transcript of the inbound dialogue.
//!
//! When `--debugtrace PREFIX` is set, each worker appends every byte it
//! reads from or writes to its inbound clients, body included, to
//! `PREFIX.<pid>`. One worker per file; the sink lives for the whole
//! worker lifetime.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct TraceSink {
    path: PathBuf,
    file: File,
}

impl TraceSink {
    pub fn create(prefix: &Path) -> anyhow::Result<Self> {
        let path = PathBuf::from(format!("{}.{}", prefix.display(), std::process::id()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening debug trace {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transcript writes must never abort a session; a failing trace is
    /// reported and the dialogue continues.
    pub fn record(&mut self, bytes: &[u8]) {
        if let Err(err) = self.file.write_all(bytes) {
            tracing::warn!("debug trace write to {} failed: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn transcript_is_appended_under_prefix_pid() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("trace");

        let mut sink = TraceSink::create(&prefix).unwrap();
        sink.record(b"EHLO c\r\n");
        sink.record(b"250 ok\r\n");

        let expected = format!("trace.{}", std::process::id());
        assert_equal!(
            sink.path().file_name().unwrap().to_str().unwrap(),
            expected.as_str()
        );
        let contents = std::fs::read(sink.path()).unwrap();
        assert_equal!(contents, b"EHLO c\r\n250 ok\r\n".to_vec());
    }
}
