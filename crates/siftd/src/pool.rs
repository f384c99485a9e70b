//! The preforked worker pool.
//!
//! The parent process owns the listening socket and the worker registry and
//! does no per-connection work. Workers inherit the socket across fork and
//! accept on it directly; the kernel serializes concurrent accepts, so no
//! user-space coordination is needed.

use anyhow::Context;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::worker;
use crate::ProxyConfig;

/// Pause after each fork so a crash-looping worker cannot turn the
/// supervisor into a fork storm.
const FORK_DAMPING: Duration = Duration::from_millis(100);

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

// Async-signal-safe: the handler only sets the flag. It is acted upon at
// the safe points in the supervision loop, right after wait() or fork()
// return.
extern "C" fn note_term(_signal: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_term_handler() -> anyhow::Result<()> {
    // SA_RESTART is deliberately not set: a pending waitpid must return
    // with EINTR so the loop can observe the flag instead of blocking
    // until the next worker exit.
    let action = SigAction::new(
        SigHandler::Handler(note_term),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("sigaction SIGTERM")?;
        sigaction(Signal::SIGINT, &action).context("sigaction SIGINT")?;
    }
    Ok(())
}

/// Restore the default dispositions in a freshly forked worker so the
/// parent's broadcast reliably terminates it.
fn reset_term_disposition() -> anyhow::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("sigaction SIGTERM default")?;
        sigaction(Signal::SIGINT, &action).context("sigaction SIGINT default")?;
    }
    Ok(())
}

/// Run the supervision loop: keep `config.children` workers alive, replace
/// the ones that exit, and on SIGTERM/SIGINT broadcast the signal to the
/// registry and return so the process exits 0.
pub fn supervise(listener: TcpListener, config: &ProxyConfig) -> anyhow::Result<()> {
    install_term_handler()?;

    let mut workers: HashMap<Pid, Instant> = HashMap::new();

    loop {
        if TERM_REQUESTED.load(Ordering::SeqCst) {
            return shut_down(&workers);
        }

        if workers.len() < config.children {
            match unsafe { fork() }.context("fork")? {
                ForkResult::Child => {
                    // The child never returns into the supervision loop.
                    let code = match run_worker(&listener, config) {
                        Ok(()) => 0,
                        Err(err) => {
                            error!("worker exiting on error: {err:#}");
                            1
                        }
                    };
                    std::process::exit(code);
                }
                ForkResult::Parent { child } => {
                    debug!("forked worker {child}");
                    workers.insert(child, Instant::now());
                    std::thread::sleep(FORK_DAMPING);
                }
            }
            continue;
        }

        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                let age = workers.remove(&pid).map(|born| born.elapsed());
                debug!("worker {pid} exited with status {code} after {age:?}");
            }
            Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                workers.remove(&pid);
                error!("worker {pid} killed by {signal:?}; forking a replacement");
            }
            Ok(_) => {}
            // Interrupted by the termination signal; the flag is checked
            // at the top of the loop.
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {}
            Err(err) => return Err(err).context("waitpid"),
        }
    }
}

fn run_worker(listener: &TcpListener, config: &ProxyConfig) -> anyhow::Result<()> {
    reset_term_disposition()?;
    worker::run(listener, config)
}

fn shut_down(workers: &HashMap<Pid, Instant>) -> anyhow::Result<()> {
    info!("terminating {} workers", workers.len());
    for pid in workers.keys() {
        if let Err(err) = kill(*pid, Signal::SIGTERM) {
            // Already gone; nothing to clean up, the registry dies with us.
            debug!("SIGTERM to {pid}: {err}");
        }
    }
    Ok(())
}
