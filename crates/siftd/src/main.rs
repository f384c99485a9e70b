use anyhow::Context;
use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use tracing::info;

mod client;
mod pipeline;
mod pool;
mod server;
mod spool;
mod trace;
mod worker;

/// Transparent SMTP content-filter proxy.
///
/// Interposes between an SMTP client and an SMTP server, relays the
/// dialogue verbatim, and pipes each message body through an external
/// chain of stdin/stdout filter programs before passing it upstream.
///
/// Filter arguments after the two address pairs are each one
/// whitespace-separated command line, composed left to right:
///
/// `siftd 127.0.0.1:10025 127.0.0.1:10026 'sed s/foo/bar/' 'tr a-z A-Z'`
#[derive(Clone, Debug, Parser)]
#[command(about)]
struct Opt {
    /// Number of preforked worker processes.
    #[arg(long, default_value_t = 16)]
    children: usize,

    /// Lower bound of the number of sessions a worker serves before it
    /// exits and is replaced.
    #[arg(long = "minperchild", default_value_t = 100)]
    min_per_child: u32,

    /// Upper bound of the number of sessions a worker serves before it
    /// exits and is replaced.
    #[arg(long = "maxperchild", default_value_t = 200)]
    max_per_child: u32,

    /// Present this name to inbound clients: the banner becomes
    /// `220 <FQDN> ESMTP filter proxy`, outbound HELO/EHLO carry it as
    /// their argument, and the identity line of the upstream EHLO reply
    /// is rewritten to it.
    #[arg(long, value_name = "FQDN")]
    helo: Option<String>,

    /// Write a per-worker transcript of the inbound dialogue to
    /// `PREFIX.<pid>` and advertise the filename in the banner.
    #[arg(long = "debugtrace", value_name = "PREFIX")]
    debug_trace: Option<PathBuf>,

    /// Address to listen on, ADDR:PORT.
    listen: String,

    /// Upstream SMTP server, ADDR:PORT.
    upstream: String,

    /// Filter command lines, applied in order to each message body.
    filters: Vec<String>,
}

/// Everything a worker needs to serve sessions. Built once in the parent
/// and inherited across fork.
#[derive(Debug)]
pub(crate) struct ProxyConfig {
    pub children: usize,
    pub min_per_child: u32,
    pub max_per_child: u32,
    pub helo: Option<String>,
    pub debug_trace: Option<PathBuf>,
    pub upstream: String,
    pub filters: Vec<Vec<String>>,
}

fn parse_filter_spec(spec: &str) -> anyhow::Result<Vec<String>> {
    let argv: Vec<String> = spec.split_whitespace().map(str::to_string).collect();
    anyhow::ensure!(!argv.is_empty(), "empty filter specification");
    Ok(argv)
}

impl Opt {
    fn into_config(self) -> anyhow::Result<(String, ProxyConfig)> {
        anyhow::ensure!(
            self.min_per_child >= 1,
            "--minperchild must be at least one session"
        );
        anyhow::ensure!(
            self.min_per_child <= self.max_per_child,
            "--minperchild {} must not exceed --maxperchild {}",
            self.min_per_child,
            self.max_per_child
        );
        anyhow::ensure!(self.children >= 1, "--children must be at least one");

        let filters = self
            .filters
            .iter()
            .map(|spec| parse_filter_spec(spec))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok((
            self.listen,
            ProxyConfig {
                children: self.children,
                min_per_child: self.min_per_child,
                max_per_child: self.max_per_child,
                helo: self.helo,
                debug_trace: self.debug_trace,
                upstream: self.upstream,
                filters,
            },
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SIFTD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("siftd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (listen, config) = opts.into_config()?;

    let listener =
        TcpListener::bind(&listen).with_context(|| format!("binding listener on {listen}"))?;
    info!(
        "proxying {} -> {} with {} workers and {} filter stage(s)",
        listen,
        config.upstream,
        config.children,
        config.filters.len()
    );

    pool::supervise(listener, &config)
}
