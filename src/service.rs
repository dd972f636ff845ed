// service.rs - background thread driving the transport
// Numan Thabit 2025

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::debug;

use crate::api::Sockets;

/// Longest the service thread sleeps between pump passes.  Sockets are
/// non-blocking, so this bounds inbound dispatch latency.
const MAX_TICK: Duration = Duration::from_millis(5);

/// Handle to the background service thread.
///
/// The thread repeatedly pumps the context (drain sockets, run think
/// deadlines, reap dead connections) and sleeps until the earliest
/// connection deadline, capped at [`MAX_TICK`].
pub struct ServiceThread {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServiceThread {
    /// Spawns the service thread for `sockets`.
    pub fn spawn(sockets: Sockets) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("numilink-service".into())
            .spawn(move || {
                debug!("service thread started");
                while !flag.load(Ordering::Relaxed) {
                    let next = sockets.pump();
                    let now = sockets.now();
                    let sleep = Duration::from_micros(next.saturating_sub(now)).min(MAX_TICK);
                    if !sleep.is_zero() {
                        std::thread::sleep(sleep);
                    }
                }
                debug!("service thread stopped");
            })?;
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}
