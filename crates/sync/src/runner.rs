#![forbid(unsafe_code)]

//! Background thread that turns reachability reports, explicit requests and a periodic timer
//! into sync cycles.

use crate::auth::AuthProvider;
use crate::engine::SyncEngine;
use crate::monitor::{ConnectivityMonitor, Reachability};
use crate::remote::RemoteClient;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tk_storage::Backend;

const MAX_SETTLE_TICK: Duration = Duration::from_millis(1_000);

enum Command {
    Reachability(Reachability),
    SyncNow,
    Shutdown,
}

pub struct SyncRunner {
    commands: Sender<Command>,
    cancel: Box<dyn Fn() + Send + Sync>,
    handle: Option<JoinHandle<()>>,
}

impl SyncRunner {
    /// Starts the runner thread. When `initial` is online a first cycle runs right away.
    pub fn spawn<S, R, A>(engine: Arc<SyncEngine<S, R, A>>, initial: Reachability) -> Self
    where
        S: Backend + Send + 'static,
        R: RemoteClient + 'static,
        A: AuthProvider + 'static,
    {
        let (commands, inbox) = mpsc::channel();
        let cancel_engine = Arc::clone(&engine);
        let handle = std::thread::spawn(move || run_loop(&engine, initial, inbox));
        Self {
            commands,
            cancel: Box::new(move || cancel_engine.cancel()),
            handle: Some(handle),
        }
    }

    pub fn report_reachability(&self, reachability: Reachability) {
        let _ = self.commands.send(Command::Reachability(reachability));
    }

    /// Runs a cycle soon if online. Requests queued while a cycle runs collapse into one.
    pub fn sync_now(&self) {
        let _ = self.commands.send(Command::SyncNow);
    }

    /// Cancels the running cycle, if any, and joins the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        (self.cancel)();
        let _ = self.commands.send(Command::Shutdown);
        if handle.join().is_err() {
            tracing::warn!("sync runner thread panicked");
        }
    }
}

impl Drop for SyncRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<S, R, A>(
    engine: &SyncEngine<S, R, A>,
    initial: Reachability,
    inbox: Receiver<Command>,
) where
    S: Backend + Send,
    R: RemoteClient,
    A: AuthProvider,
{
    let config = engine.config();
    let mut monitor = ConnectivityMonitor::new(initial, config.connectivity_cooldown_ms);
    let interval = Duration::from_millis(config.periodic_interval_ms);
    let settle_tick =
        Duration::from_millis(config.connectivity_cooldown_ms.max(1)).min(MAX_SETTLE_TICK);
    let mut next_periodic = Instant::now() + interval;
    let mut requested = monitor.is_online();
    tracing::info!(online = monitor.is_online(), "sync runner started");

    loop {
        if requested && monitor.is_online() {
            run_cycle(engine);
        }
        requested = false;

        let mut wait = next_periodic.saturating_duration_since(Instant::now());
        if monitor.has_pending() {
            wait = wait.min(settle_tick);
        }
        let first = match inbox.recv_timeout(wait) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        for command in first.into_iter().chain(inbox.try_iter()) {
            match command {
                Command::Reachability(reachability) => {
                    requested |= monitor.observe(reachability, engine.now_ms());
                }
                Command::SyncNow => requested = true,
                Command::Shutdown => {
                    tracing::info!("sync runner stopped");
                    return;
                }
            }
        }
        requested |= monitor.poll(engine.now_ms());
        if Instant::now() >= next_periodic {
            next_periodic = Instant::now() + interval;
            requested |= monitor.is_online();
        }
    }
    tracing::info!("sync runner stopped");
}

fn run_cycle<S, R, A>(engine: &SyncEngine<S, R, A>)
where
    S: Backend + Send,
    R: RemoteClient,
    A: AuthProvider,
{
    // Errors are logged by the engine; the next trigger tries again.
    if let Ok(report) = engine.run_sync_cycle() {
        if !report.is_clean() {
            tracing::debug!(
                failures = report.failures.len(),
                conflicts_manual = report.conflicts_manual,
                pull_errors = report.pull_errors.len(),
                "background cycle finished with issues"
            );
        }
    }
}
