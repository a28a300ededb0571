//! Clean exit on SIGINT / SIGTERM.
//!
//! A dedicated thread waits for the signal on a current-thread tokio runtime,
//! so the blocking session loop never has to poll for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use crate::memory::release_extra_memory;

static TORN_DOWN: AtomicBool = AtomicBool::new(false);

/// Release what can be released and flush the process log.
///
/// Safe to call from any thread, any number of times; only the first call
/// does anything. Returns whether this call did the work.
pub fn teardown() -> bool {
    if TORN_DOWN.swap(true, Ordering::SeqCst) {
        return false;
    }
    release_extra_memory();
    log::info!("Teardown complete");
    log::logger().flush();
    true
}

pub fn is_torn_down() -> bool {
    TORN_DOWN.load(Ordering::SeqCst)
}

/// Install the interrupt/terminate handlers.
///
/// Returns once the handlers are registered. On signal the process prints a
/// notice, runs [`teardown`] and exits with status 0.
pub fn install_shutdown_handler() -> std::io::Result<()> {
    spawn_signal_listener(|name| {
        eprintln!("\nRecebido sinal de interrupção. Limpando recursos...");
        log::warn!("{name} received, shutting down");
        teardown();
        std::process::exit(0);
    })
}

/// Run `on_signal` on a dedicated thread once SIGINT or SIGTERM arrives.
fn spawn_signal_listener<F>(on_signal: F) -> std::io::Result<()>
where
    F: FnOnce(&'static str) + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (ready_tx, ready_rx) = mpsc::channel::<std::io::Result<()>>();

    thread::Builder::new()
        .name("shutdown-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                match wait_for_signal(ready_tx).await {
                    Ok(name) => on_signal(name),
                    Err(e) => log::error!("Signal listener stopped: {e}"),
                }
            });
        })?;

    ready_rx
        .recv()
        .map_err(|_| std::io::Error::other("signal listener exited before registering"))?
}

#[cfg(unix)]
async fn wait_for_signal(ready: mpsc::Sender<std::io::Result<()>>) -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let registered = signal(SignalKind::interrupt())
        .and_then(|int| signal(SignalKind::terminate()).map(|term| (int, term)));
    let (mut interrupt, mut terminate) = match registered {
        Ok(pair) => {
            let _ = ready.send(Ok(()));
            pair
        }
        Err(e) => {
            let msg = e.to_string();
            let _ = ready.send(Err(e));
            return Err(std::io::Error::other(msg));
        }
    };

    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(ready: mpsc::Sender<std::io::Result<()>>) -> std::io::Result<&'static str> {
    let ctrl_c = tokio::signal::ctrl_c();
    let _ = ready.send(Ok(()));
    ctrl_c.await.map(|_| "Ctrl-C")
}
