//! File-backed storage for one captured message body.
//!
//! The body arrives during the DATA phase, already dot-unstuffed and with
//! CRLF line endings, and may be replaced wholesale by the filter
//! pipeline's output. Backing the bytes with an unlinked temporary file
//! keeps memory flat for arbitrarily large messages and gives the pipeline
//! a seekable stream to replay.

use std::io::{Seek, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

#[derive(Debug)]
pub struct BodySpool {
    file: File,
    len: u64,
}

impl BodySpool {
    pub fn create() -> std::io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            file: File::from_std(file),
            len: 0,
        })
    }

    /// Adopts a file written by someone else (the pipeline's output sink),
    /// rewound so the next reader starts at byte zero.
    pub fn from_std_file(mut file: std::fs::File) -> std::io::Result<Self> {
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file: File::from_std(file),
            len,
        })
    }

    /// Appends one body line; the stored form always terminates with CRLF.
    pub async fn append_line(&mut self, content: &[u8]) -> std::io::Result<()> {
        self.file.write_all(content).await?;
        self.file.write_all(b"\r\n").await?;
        self.len += content.len() as u64 + 2;
        Ok(())
    }

    pub async fn rewind(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn append_rewind_read_back() {
        let mut spool = BodySpool::create().unwrap();
        spool.append_line(b"Subject: t").await.unwrap();
        spool.append_line(b"").await.unwrap();
        spool.append_line(b"hi").await.unwrap();
        assert_equal!(spool.len(), 18);

        spool.rewind().await.unwrap();
        let mut contents = Vec::new();
        spool.file_mut().read_to_end(&mut contents).await.unwrap();
        assert_equal!(contents, b"Subject: t\r\n\r\nhi\r\n".to_vec());

        // A second rewind replays from the start.
        spool.rewind().await.unwrap();
        let mut again = Vec::new();
        spool.file_mut().read_to_end(&mut again).await.unwrap();
        assert_equal!(again, contents);
    }

    #[tokio::test]
    async fn adopting_a_sink_rewinds_it() {
        use std::io::Write;
        let mut sink = tempfile::tempfile().unwrap();
        sink.write_all(b"FILTERED\r\n").unwrap();

        let mut spool = BodySpool::from_std_file(sink).unwrap();
        assert_equal!(spool.len(), 10);
        let mut contents = Vec::new();
        spool.file_mut().read_to_end(&mut contents).await.unwrap();
        assert_equal!(contents, b"FILTERED\r\n".to_vec());
    }
}
