//! The DATA-phase content-filter pipeline.
//!
//! Filters are arbitrary executables that read a message on stdin and
//! write a possibly transformed message on stdout. All stages are spawned
//! up front and joined stdout-to-stdin by OS pipes, so intermediate bytes
//! never pass through this process; only the first stage's stdin is fed
//! from the body spool, concurrently with reaping so a body larger than
//! the first pipe's capacity cannot deadlock the session. The last
//! stage's stdout lands in an unlinked temporary file, which becomes the
//! replacement body spool once every stage has exited zero.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::spool::BodySpool;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to spawn filter {argv:?}: {error}")]
    Spawn {
        argv: Vec<String>,
        error: std::io::Error,
    },
    #[error("filter {argv:?} exited with {status}")]
    Failed {
        argv: Vec<String>,
        status: std::process::ExitStatus,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs the body through the configured filter chain and returns the
/// replacement body. An empty chain is the identity.
pub async fn run(filters: &[Vec<String>], mut body: BodySpool) -> Result<BodySpool, PipelineError> {
    if filters.is_empty() {
        return Ok(body);
    }

    let sink = tempfile::tempfile()?;
    let last = filters.len() - 1;
    let mut children: Vec<Child> = Vec::with_capacity(filters.len());
    // Stdout of the previously spawned stage, handed to the next stage as
    // its stdin without surfacing in user space.
    let mut upstream_pipe: Option<Stdio> = None;

    for (i, argv) in filters.iter().enumerate() {
        let stdin = match upstream_pipe.take() {
            Some(pipe) => pipe,
            None => Stdio::piped(),
        };
        let stdout = if i == last {
            Stdio::from(sink.try_clone()?)
        } else {
            Stdio::piped()
        };

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| PipelineError::Spawn {
                argv: argv.clone(),
                error,
            })?;

        upstream_pipe = match child.stdout.take() {
            Some(pipe) => Some(pipe.try_into()?),
            None => None,
        };
        children.push(child);
    }

    let mut first_stdin = children[0]
        .stdin
        .take()
        .expect("first filter stdin is piped");

    let feeder = async {
        body.rewind().await?;
        tokio::io::copy(body.file_mut(), &mut first_stdin).await?;
        first_stdin.shutdown().await?;
        drop(first_stdin);
        Ok::<_, std::io::Error>(())
    };

    let reaper = async {
        let mut statuses = Vec::with_capacity(children.len());
        for child in children.iter_mut() {
            statuses.push(child.wait().await?);
        }
        Ok::<_, std::io::Error>(statuses)
    };

    let (fed, statuses) = tokio::join!(feeder, reaper);
    let statuses = statuses?;

    if let Some((argv, status)) = filters
        .iter()
        .zip(&statuses)
        .find(|(_, status)| !status.success())
    {
        return Err(PipelineError::Failed {
            argv: argv.clone(),
            status: *status,
        });
    }

    match fed {
        // A filter may legitimately stop reading before the body is
        // exhausted; as long as every stage exited zero the pipe closing
        // early is not a failure.
        Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => return Err(err.into()),
        _ => {}
    }

    Ok(BodySpool::from_std_file(sink)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use tokio::io::AsyncReadExt;

    fn argv(spec: &str) -> Vec<String> {
        spec.split_whitespace().map(str::to_string).collect()
    }

    async fn spool_from(lines: &[&[u8]]) -> BodySpool {
        let mut spool = BodySpool::create().unwrap();
        for line in lines {
            spool.append_line(line).await.unwrap();
        }
        spool
    }

    async fn contents(mut spool: BodySpool) -> Vec<u8> {
        spool.rewind().await.unwrap();
        let mut bytes = Vec::new();
        spool.file_mut().read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let body = spool_from(&[b"hello"]).await;
        let out = run(&[], body).await.unwrap();
        assert_equal!(contents(out).await, b"hello\r\n".to_vec());
    }

    #[tokio::test]
    async fn single_filter_transforms_the_body() {
        let body = spool_from(&[b"hello"]).await;
        let out = run(&[argv("tr a-z A-Z")], body).await.unwrap();
        assert_equal!(contents(out).await, b"HELLO\r\n".to_vec());
    }

    #[tokio::test]
    async fn stages_compose_in_declaration_order() {
        let body = spool_from(&[b"foo"]).await;
        let out = run(&[argv("sed s/foo/bar/"), argv("tr a-z A-Z")], body)
            .await
            .unwrap();
        assert_equal!(contents(out).await, b"BAR\r\n".to_vec());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_pipeline() {
        let body = spool_from(&[b"hello"]).await;
        let err = run(&[argv("false")], body).await.unwrap_err();
        assert!(matches!(err, PipelineError::Failed { .. }));
    }

    #[tokio::test]
    async fn failure_anywhere_in_the_chain_is_reported() {
        let body = spool_from(&[b"hello"]).await;
        let err = run(&[argv("cat"), argv("false"), argv("cat")], body)
            .await
            .unwrap_err();
        match err {
            PipelineError::Failed { argv, .. } => assert_equal!(argv, vec!["false".to_string()]),
            other => panic!("unexpected error: {other}"),
        };
    }

    #[tokio::test]
    async fn unknown_executable_is_a_spawn_error() {
        let body = spool_from(&[b"hello"]).await;
        let err = run(&[argv("siftd-no-such-filter")], body).await.unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }

    // A body much larger than a pipe buffer must flow through while the
    // children are being awaited; this deadlocks if feeding and reaping
    // are sequential.
    #[tokio::test]
    async fn large_bodies_do_not_deadlock() {
        let line = [b'x'; 998];
        let mut spool = BodySpool::create().unwrap();
        for _ in 0..1024 {
            spool.append_line(&line).await.unwrap();
        }
        let expected_len = spool.len();

        let out = run(&[argv("cat"), argv("cat")], spool).await.unwrap();
        assert_equal!(out.len(), expected_len);
    }
}
