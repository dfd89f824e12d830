use super::{poll_exit, HelperExit};
use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelperDeath {
    pub pid: libc::pid_t,
    /// `None` when the pid could not be waited on (not our child, or reaped
    /// elsewhere).
    pub exit: Option<HelperExit>,
}

/// Opt-in watchdog over a set of helper pids. Reports the first death and
/// stops; the caller decides whether to tear the rest down.
///
/// Reaps the child it reports. Pids handed to a monitor should not also be
/// polled by the caller.
pub struct HelperMonitor {
    runtime: Runtime,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl HelperMonitor {
    pub fn spawn(
        pids: Vec<libc::pid_t>,
        interval: Duration,
    ) -> anyhow::Result<(Self, Receiver<HelperDeath>)> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_time()
            .build()?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let shutdown = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&shutdown);

        logger::breadcrumb(
            BreadcrumbFlags::PROCESS,
            format!("monitoring helpers {pids:?} every {interval:?}"),
        );

        let monitor = Self {
            runtime,
            task: Mutex::new(None),
            shutdown,
        };
        let handle = monitor.runtime.spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_signal.notified() => break,
                }
                if let Some(death) = first_death(&pids) {
                    logger::error(format!(
                        "helper pid={} died unexpectedly: {:?}",
                        death.pid, death.exit
                    ));
                    let _ = tx.send(death);
                    break;
                }
            }
        });
        *monitor.task.lock() = Some(handle);

        Ok((monitor, rx))
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HelperMonitor {
    fn drop(&mut self) {
        self.stop();
        logger::breadcrumb(BreadcrumbFlags::PROCESS, "helper monitor stopped");
    }
}

fn first_death(pids: &[libc::pid_t]) -> Option<HelperDeath> {
    pids.iter().find_map(|&pid| match poll_exit(pid) {
        Ok(Some(exit)) => Some(HelperDeath {
            pid,
            exit: Some(exit),
        }),
        Ok(None) => None,
        Err(_) => Some(HelperDeath { pid, exit: None }),
    })
}
