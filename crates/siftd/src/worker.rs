//! Worker process: serves sessions one at a time until its randomized
//! lifetime is exhausted, then exits so the parent forks a fresh
//! replacement.
//!
//! The relay loop in [`relay`] is the session orchestrator: it weaves the
//! inbound server session, the outbound client session and the filter
//! pipeline together, forwarding one reply per command and diverting the
//! DATA payload through the filters.

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::TcpListener;
use tracing::{debug, error};

use crate::client::ClientSession;
use crate::pipeline;
use crate::server::{ServerSession, SessionEvent};
use crate::trace::TraceSink;
use crate::ProxyConfig;
use smtp_wire::{Reply, Verb};
use tokio::io::{AsyncRead, AsyncWrite};

/// Uniform draw of the number of sessions this worker will serve. Bounded
/// lifetimes keep slow resource leaks from accumulating; the jitter keeps
/// the pool from retiring all workers at once.
fn draw_lifetime<R: Rng>(rng: &mut R, min: u32, max: u32) -> u32 {
    rng.gen_range(min..=max)
}

pub fn run(listener: &TcpListener, config: &ProxyConfig) -> anyhow::Result<()> {
    let pid = std::process::id();

    // Fresh OS entropy: the draw must not be correlated with our siblings
    // through RNG state inherited across fork.
    let mut rng = StdRng::from_entropy();
    let mut remaining = draw_lifetime(&mut rng, config.min_per_child, config.max_per_child);
    debug!("worker {pid} will serve {remaining} sessions");

    let mut trace = match &config.debug_trace {
        Some(prefix) => Some(TraceSink::create(prefix)?),
        None => None,
    };

    let listener = listener.try_clone().context("cloning inherited listener")?;
    listener
        .set_nonblocking(true)
        .context("listener nonblocking")?;

    // The runtime is built after fork, so it is private to this worker.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building worker runtime")?;

    runtime.block_on(async {
        let listener =
            tokio::net::TcpListener::from_std(listener).context("adopting inherited listener")?;

        while remaining > 0 {
            let (stream, peer) = listener.accept().await.context("accept")?;
            debug!("worker {pid} accepted {peer}");
            if let Err(err) = serve_session(stream, config, trace.as_mut()).await {
                debug!("session with {peer} aborted: {err:#}");
            }
            remaining -= 1;
            debug!("worker {pid} has {remaining} sessions left");
        }

        debug!("worker {pid} lifetime exhausted");
        Ok(())
    })
}

async fn serve_session(
    stream: tokio::net::TcpStream,
    config: &ProxyConfig,
    trace: Option<&mut TraceSink>,
) -> anyhow::Result<()> {
    let server = ServerSession::new(stream, trace);
    let client = ClientSession::connect(&config.upstream).await?;
    relay(server, client, config).await
}

/// Rewrites the identity announcement of a multi-line EHLO reply. Only the
/// first line carries the hostname; extension lines such as `250-SIZE ...`
/// must pass through untouched.
fn rewrite_identity_line(reply: &mut Reply, fqdn: &str) {
    if let Some(first) = reply.lines.first_mut() {
        if first.starts_with("250-") {
            *first = format!("250-{fqdn}");
        }
    }
}

/// The per-session relay loop: one upstream reply relayed per inbound
/// command, with local handling for the banner, the HELO/EHLO rewrite and
/// the captured DATA payload.
pub(crate) async fn relay<S, C>(
    mut server: ServerSession<'_, S>,
    mut client: ClientSession<C>,
    config: &ProxyConfig,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite,
    C: AsyncRead + AsyncWrite,
{
    let banner = client.read_reply().await?;
    match &config.helo {
        Some(fqdn) => {
            let mut line = format!("220 {fqdn} ESMTP filter proxy");
            if let Some(path) = server.trace_path() {
                line.push_str(&format!(" (trace {})", path.display()));
            }
            server.send_line(&line).await?;
        }
        None => server.relay_reply(&banner).await?,
    }

    while let Some(event) = server.next_event().await? {
        match event {
            SessionEvent::Command(line) => {
                match (&config.helo, Verb::classify(&line)) {
                    (Some(fqdn), Verb::Helo | Verb::Ehlo) => {
                        // Preserve the verb as the client spelled it,
                        // substitute our identity for the argument.
                        let rewritten = format!("{} {fqdn}", &line[..4]);
                        client.send_line(&rewritten).await?;
                        let mut reply = client.read_reply().await?;
                        rewrite_identity_line(&mut reply, fqdn);
                        server.relay_reply(&reply).await?;
                    }
                    _ => {
                        client.send_line(&line).await?;
                        let reply = client.read_reply().await?;
                        server.relay_reply(&reply).await?;
                    }
                }
            }
            SessionEvent::BodyReady => {
                let body = server.take_body().context("no captured body")?;
                let body = if config.filters.is_empty() {
                    body
                } else {
                    match pipeline::run(&config.filters, body).await {
                        Ok(filtered) => filtered,
                        Err(err) => {
                            error!("content filter pipeline failed: {err}");
                            // Best effort; the session dies either way.
                            server.send_line("554 content filter failed").await.ok();
                            anyhow::bail!("content filter pipeline failed");
                        }
                    }
                };

                client.send_line("DATA").await?;
                let go_ahead = client.read_reply().await?;
                if go_ahead.code != 354 {
                    // Upstream refused the transaction; relay the refusal
                    // and leave the client free to RSET and retry.
                    server.relay_reply(&go_ahead).await?;
                    continue;
                }
                client.send_body(body).await?;
                let outcome = client.read_reply().await?;
                server.relay_reply(&outcome).await?;
            }
        }
    }

    Ok(())
}
