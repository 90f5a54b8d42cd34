//! Session Synchronizer: pushes local desktop state to the record API in the
//! background without ever holding up a store mutation.
//!
//! Background work is fire-and-forget: results are logged, never surfaced
//! and never retried. Only the two session boundaries await their calls.

use crate::error::{ErrorClass, GatewayError};
use crate::gateway::RecordGateway;
use crate::lock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webdesk_core::{window_metadata, DesktopPrefs, DesktopState, VirtualProcess, Window};

/// Submission point for detached gateway calls.
#[derive(Clone)]
pub struct TaskQueue {
    in_flight: Arc<watch::Sender<usize>>,
}

struct InFlight(Arc<watch::Sender<usize>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            in_flight: Arc::new(tx),
        }
    }

    /// Spawns `work`. A failure is logged under `task` with `subject` as
    /// context; reconciliation misses only at debug level.
    pub fn submit<F>(&self, task: &'static str, subject: String, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.in_flight.send_modify(|count| *count += 1);
        let guard = InFlight(self.in_flight.clone());
        tokio::spawn(async move {
            let _guard = guard;
            match work.await {
                Ok(()) => debug!(event = "sync_task_done", task, subject = %subject),
                Err(err) if err.class() == ErrorClass::Reconciliation => {
                    debug!(event = "sync_task_miss", task, subject = %subject, error = %err)
                }
                Err(err) => {
                    warn!(event = "sync_task_failed", task, subject = %subject, error = %err)
                }
            }
        })
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Resolves once no submitted task is running.
    pub async fn idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// What the session-ending flush managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlush {
    pub saved: bool,
    pub cleared: bool,
}

pub struct SessionSynchronizer {
    gateway: Arc<dyn RecordGateway>,
    tasks: TaskQueue,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every schedule and cancel; an autosave whose generation is
    /// no longer current skips its write.
    generation: Arc<AtomicU64>,
    /// Held for the duration of every desktop-state write, so writes land
    /// in the order they were issued.
    save_turn: Arc<AsyncMutex<()>>,
}

impl SessionSynchronizer {
    pub fn new(gateway: Arc<dyn RecordGateway>, debounce: Duration) -> Self {
        Self {
            gateway,
            tasks: TaskQueue::new(),
            debounce,
            pending: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            save_turn: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Trailing-edge debounce: only the latest state is saved, `debounce`
    /// after the latest call.
    pub fn schedule_save(&self, state: DesktopState) {
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.generation.clone();
        let turn = self.save_turn.clone();
        let gateway = self.gateway.clone();
        let tasks = self.tasks.clone();
        let delay = self.debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let windows = state.windows.len();
            tasks.submit("desktop_save", format!("{windows} windows"), async move {
                let _turn = turn.lock().await;
                if current.load(Ordering::SeqCst) != generation {
                    debug!(event = "desktop_save_superseded", generation);
                    return Ok(());
                }
                gateway.save_desktop_state(&state).await
            });
        }));
    }

    pub fn has_pending_save(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the debounce timer and voids any autosave that has not reached
    /// the gateway yet. Returns whether a timer was still waiting.
    pub fn cancel_pending_save(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match lock(&self.pending).take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Records a virtual process for a freshly opened window.
    pub fn window_opened(&self, window: &Window) {
        let gateway = self.gateway.clone();
        let app = window.app.clone();
        let window_id = window.id.clone();
        self.tasks.submit("vproc_start", window.id.clone(), async move {
            let process = gateway
                .start_virtual(&app, window_metadata(&window_id))
                .await?;
            debug!(event = "vproc_started", window_id = %window_id, process_id = %process.id);
            Ok(())
        });
    }

    /// Deletes the virtual process belonging to a window being closed.
    pub fn window_closing(&self, window: &Window) {
        let gateway = self.gateway.clone();
        let app = window.app.clone();
        let window_id = window.id.clone();
        self.tasks.submit("vproc_reconcile", window.id.clone(), async move {
            let records = gateway.list_virtual().await?;
            let Some(record) = match_record(&records, &window_id, &app) else {
                debug!(
                    event = "vproc_reconcile_miss",
                    window_id = %window_id,
                    app = %app,
                    candidates = records.iter().filter(|r| r.app == app).count()
                );
                return Ok(());
            };
            gateway.delete_virtual(&record.id).await
        });
    }

    /// Clears stale records, then loads the prefs to restore. Windows never
    /// carry over between sessions.
    pub async fn start_session(&self) -> Result<DesktopPrefs, GatewayError> {
        if let Err(err) = self.gateway.delete_all_virtual().await {
            warn!(event = "session_cleanup_failed", error = %err);
        }
        match self.gateway.desktop_state().await {
            Ok(state) => {
                info!(
                    event = "session_started",
                    discarded_windows = state.windows.len()
                );
                Ok(state.prefs())
            }
            Err(err) if err.is_auth() => Err(err),
            Err(err) => {
                warn!(event = "desktop_state_load_failed", error = %err);
                Ok(DesktopPrefs::default())
            }
        }
    }

    /// Drops any pending save, waits out an autosave already on the wire,
    /// then awaits a final save and the bulk delete.
    pub async fn end_session(&self, state: DesktopState) -> SessionFlush {
        self.cancel_pending_save();
        let _turn = self.save_turn.lock().await;
        let (saved, cleared) = tokio::join!(
            self.gateway.save_desktop_state(&state),
            self.gateway.delete_all_virtual()
        );
        if let Err(err) = &saved {
            warn!(event = "session_final_save_failed", error = %err);
        }
        if let Err(err) = &cleared {
            warn!(event = "session_cleanup_failed", error = %err);
        }
        let flush = SessionFlush {
            saved: saved.is_ok(),
            cleared: cleared.is_ok(),
        };
        info!(event = "session_ended", saved = flush.saved, cleared = flush.cleared);
        flush
    }
}

/// Picks the record to delete for a closing window: the one tagged with its
/// id, else the only record of its app. Several untagged candidates match
/// nothing.
pub fn match_record<'a>(
    records: &'a [VirtualProcess],
    window_id: &str,
    app: &str,
) -> Option<&'a VirtualProcess> {
    if let Some(exact) = records
        .iter()
        .find(|record| record.window_id() == Some(window_id))
    {
        return Some(exact);
    }
    let mut same_app = records.iter().filter(|record| record.app == app);
    match (same_app.next(), same_app.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}
