//! Signaling Gate (SG): the single, process-wide queue in front of
//! every signaling endpoint creation. Needed because the underlying
//! signaling service bans callers that create endpoints too fast.
//!
//! The gate is a single-owner actor (design note §9, "Global mutable
//! state") — one background task drains a priority queue on a
//! ticking, adaptively-lengthened interval, and every component that
//! wants to create an endpoint gets a cloneable [`SignalingGate`]
//! handle into that task rather than touching shared state directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;

use crate::config::OverlayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

/// A queued unit of work: "go try to create this endpoint." The job
/// owns the logic to run and reports its outcome back to the caller
/// via a oneshot channel wired up by [`SignalingGate::schedule`].
type Job = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, JobOutcome> + Send>;

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success,
    Failure,
    /// The caller's "is-still-active" predicate returned false before
    /// the job ran; it was skipped rather than executed. Used for
    /// cancellation of queued election jobs on namespace teardown.
    Skipped,
}

struct QueueEntry {
    priority: Priority,
    active: Arc<std::sync::atomic::AtomicBool>,
    job: Job,
    reply: oneshot::Sender<JobOutcome>,
}

enum GateCommand {
    Schedule(QueueEntry),
    ReportSuccess,
    ReportFailure,
    CancelAll,
}

/// Snapshot of gate state, published on every transition for UI /
/// connectivity-indicator observers (§4.2 `subscribe`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateState {
    pub pending: usize,
    pub current_interval_ms: u64,
    pub throttle_count: u32,
    pub network_down: bool,
}

/// Cloneable handle to the running gate actor.
#[derive(Clone)]
pub struct SignalingGate {
    cmd_tx: mpsc::UnboundedSender<GateCommand>,
    state: Arc<Mutex<GateState>>,
    state_changed: Arc<Notify>,
}

impl SignalingGate {
    /// Spawn the gate's background task. `probe` performs the
    /// non-signaling HEAD probe used to distinguish throttling from a
    /// genuinely down network; it is injected so tests can fake it.
    pub fn spawn<P>(config: OverlayConfig, probe: P) -> Self
    where
        P: Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(GateState {
            pending: 0,
            current_interval_ms: config.sg_base_interval_ms,
            throttle_count: 0,
            network_down: false,
        }));
        let state_changed = Arc::new(Notify::new());

        tokio::spawn(run_gate(
            cmd_rx,
            config,
            Arc::new(probe),
            state.clone(),
            state_changed.clone(),
        ));

        Self {
            cmd_tx,
            state,
            state_changed,
        }
    }

    /// `schedule(fn, priority)`. `active` lets the caller mark a job
    /// dead (namespace torn down) so it is skipped rather than run if
    /// it is still queued when its turn comes — see §5 Cancellation.
    pub async fn schedule<F>(
        &self,
        priority: Priority,
        active: Arc<std::sync::atomic::AtomicBool>,
        job: F,
    ) -> JobOutcome
    where
        F: FnOnce() -> futures::future::BoxFuture<'static, JobOutcome> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let entry = QueueEntry {
            priority,
            active,
            job: Box::new(job),
            reply: reply_tx,
        };
        if self.cmd_tx.send(GateCommand::Schedule(entry)).is_err() {
            return JobOutcome::Skipped;
        }
        reply_rx.await.unwrap_or(JobOutcome::Skipped)
    }

    pub fn report_success(&self) {
        let _ = self.cmd_tx.send(GateCommand::ReportSuccess);
    }

    pub fn report_failure(&self) {
        let _ = self.cmd_tx.send(GateCommand::ReportFailure);
    }

    pub fn cancel_all(&self) {
        let _ = self.cmd_tx.send(GateCommand::CancelAll);
    }

    pub async fn current_state(&self) -> GateState {
        *self.state.lock().await
    }

    /// `subscribe(state -> ...)`: waits for the next state transition
    /// and returns the new state. Callers loop on this to react to
    /// every change, mirroring a typed event channel (design note §9).
    pub async fn subscribe_next(&self) -> GateState {
        self.state_changed.notified().await;
        *self.state.lock().await
    }
}

async fn run_gate(
    mut cmd_rx: mpsc::UnboundedReceiver<GateCommand>,
    config: OverlayConfig,
    probe: Arc<dyn Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync>,
    state: Arc<Mutex<GateState>>,
    state_changed: Arc<Notify>,
) {
    let mut high: Vec<QueueEntry> = Vec::new();
    let mut normal: Vec<QueueEntry> = Vec::new();
    let mut last_throttle_at: Option<Instant> = None;
    let mut probe_cache: Option<(Instant, bool)> = None;

    loop {
        // Drain any pending commands without blocking so a burst of
        // `schedule` calls doesn't each wait a full tick to be queued.
        while let Ok(cmd) = cmd_rx.try_recv() {
            handle_command(
                cmd,
                &mut high,
                &mut normal,
                &config,
                &probe,
                &mut probe_cache,
                &mut last_throttle_at,
                &state,
                &state_changed,
            )
            .await;
        }

        let snapshot = *state.lock().await;
        if snapshot.network_down {
            // Paused until an explicit report_success arrives.
            match cmd_rx.recv().await {
                Some(cmd) => {
                    handle_command(
                        cmd,
                        &mut high,
                        &mut normal,
                        &config,
                        &probe,
                        &mut probe_cache,
                        &mut last_throttle_at,
                        &state,
                        &state_changed,
                    )
                    .await;
                }
                None => return,
            }
            continue;
        }

        // Decay throttle count after an idle period with no new throttles.
        if let Some(at) = last_throttle_at {
            if at.elapsed() >= Duration::from_millis(config.sg_throttle_decay_idle_ms) {
                let mut s = state.lock().await;
                if s.throttle_count > 0 {
                    s.throttle_count = 0;
                    s.current_interval_ms = config.sg_base_interval_ms;
                    state_changed.notify_waiters();
                }
                last_throttle_at = None;
            }
        }

        let next = if let Some(entry) = pop_preferring_high(&mut high, &mut normal) {
            entry
        } else {
            // Nothing queued: block until a command arrives.
            match cmd_rx.recv().await {
                Some(cmd) => {
                    handle_command(
                        cmd,
                        &mut high,
                        &mut normal,
                        &config,
                        &probe,
                        &mut probe_cache,
                        &mut last_throttle_at,
                        &state,
                        &state_changed,
                    )
                    .await;
                }
                None => return,
            }
            continue;
        };

        if !entry_active(&next) {
            let _ = next.reply.send(JobOutcome::Skipped);
            continue;
        }

        let outcome = (next.job)().await;
        let _ = next.reply.send(outcome.clone());
        {
            let mut s = state.lock().await;
            s.pending = high.len() + normal.len();
            state_changed.notify_waiters();
        }

        let interval_ms = state.lock().await.current_interval_ms;
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

fn entry_active(entry: &QueueEntry) -> bool {
    entry.active.load(std::sync::atomic::Ordering::Relaxed)
}

fn pop_preferring_high(high: &mut Vec<QueueEntry>, normal: &mut Vec<QueueEntry>) -> Option<QueueEntry> {
    if !high.is_empty() {
        Some(high.remove(0))
    } else if !normal.is_empty() {
        Some(normal.remove(0))
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_command(
    cmd: GateCommand,
    high: &mut Vec<QueueEntry>,
    normal: &mut Vec<QueueEntry>,
    config: &OverlayConfig,
    probe: &Arc<dyn Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync>,
    probe_cache: &mut Option<(Instant, bool)>,
    last_throttle_at: &mut Option<Instant>,
    state: &Arc<Mutex<GateState>>,
    state_changed: &Arc<Notify>,
) {
    match cmd {
        GateCommand::Schedule(entry) => {
            match entry.priority {
                Priority::High => high.push(entry),
                Priority::Normal => normal.push(entry),
            }
            let mut s = state.lock().await;
            s.pending = high.len() + normal.len();
            state_changed.notify_waiters();
        }
        GateCommand::ReportSuccess => {
            let mut s = state.lock().await;
            let was_down = s.network_down;
            s.network_down = false;
            if s.throttle_count > 0 {
                s.throttle_count -= 1;
                s.current_interval_ms = throttle_interval_ms(config, s.throttle_count);
            }
            if was_down {
                log::info!("signaling gate: network recovered, resuming");
            }
            state_changed.notify_waiters();
        }
        GateCommand::ReportFailure => {
            let reachable = probe_reachable(probe, probe_cache, config).await;
            let mut s = state.lock().await;
            if reachable {
                s.throttle_count = (s.throttle_count + 1).min(config.sg_throttle_escalation_cap * 4);
                s.current_interval_ms = throttle_interval_ms(config, s.throttle_count);
                *last_throttle_at = Some(Instant::now());
                log::warn!(
                    "signaling gate: throttled, interval now {}ms",
                    s.current_interval_ms
                );
            } else {
                s.network_down = true;
                log::warn!("signaling gate: network appears down, pausing");
            }
            state_changed.notify_waiters();
        }
        GateCommand::CancelAll => {
            for entry in high.drain(..).chain(normal.drain(..)) {
                let _ = entry.reply.send(JobOutcome::Skipped);
            }
            let mut s = state.lock().await;
            s.pending = 0;
            state_changed.notify_waiters();
        }
    }
}

fn throttle_interval_ms(config: &OverlayConfig, throttle_count: u32) -> u64 {
    let exponent = throttle_count.min(config.sg_throttle_escalation_cap);
    let scaled = config.sg_base_interval_ms as f64 * 3f64.powi(exponent as i32);
    scaled.min(config.sg_max_interval_ms as f64) as u64
}

async fn probe_reachable(
    probe: &Arc<dyn Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync>,
    cache: &mut Option<(Instant, bool)>,
    config: &OverlayConfig,
) -> bool {
    if let Some((at, result)) = cache {
        if at.elapsed() < Duration::from_millis(config.sg_probe_cache_ms) {
            return *result;
        }
    }
    let result = probe().await;
    *cache = Some((Instant::now(), result));
    result
}

/// Default reachability probe: a HEAD request to a well-known small
/// resource, as described in §4.2.
pub fn default_probe() -> impl Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync + 'static {
    || {
        Box::pin(async move {
            let client = match reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
            {
                Ok(c) => c,
                Err(_) => return false,
            };
            client
                .head("https://www.gstatic.com/generate_204")
                .send()
                .await
                .is_ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn always_reachable() -> impl Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync + 'static {
        || Box::pin(async { true })
    }

    fn always_unreachable() -> impl Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync + 'static
    {
        || Box::pin(async { false })
    }

    #[tokio::test]
    async fn schedule_runs_jobs_and_reports_success_decays_throttle() {
        let mut config = OverlayConfig::default();
        config.sg_base_interval_ms = 5;
        let gate = SignalingGate::spawn(config, always_reachable());
        let active = Arc::new(AtomicBool::new(true));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let outcome = gate
            .schedule(Priority::Normal, active, move || {
                let ran = ran2.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Success
                })
            })
            .await;
        assert!(matches!(outcome, JobOutcome::Success));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped() {
        let mut config = OverlayConfig::default();
        config.sg_base_interval_ms = 5;
        let gate = SignalingGate::spawn(config, always_reachable());
        let active = Arc::new(AtomicBool::new(false));
        let outcome = gate
            .schedule(Priority::Normal, active, || Box::pin(async { JobOutcome::Success }))
            .await;
        assert!(matches!(outcome, JobOutcome::Skipped));
    }

    #[tokio::test]
    async fn failure_with_reachable_probe_throttles_not_downs() {
        let mut config = OverlayConfig::default();
        config.sg_base_interval_ms = 5;
        let gate = SignalingGate::spawn(config, always_reachable());
        gate.report_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = gate.current_state().await;
        assert!(!state.network_down);
        assert!(state.throttle_count >= 1);
        assert!(state.current_interval_ms > config.sg_base_interval_ms);
    }

    #[tokio::test]
    async fn failure_with_unreachable_probe_marks_network_down() {
        let mut config = OverlayConfig::default();
        config.sg_base_interval_ms = 5;
        let gate = SignalingGate::spawn(config, always_unreachable());
        gate.report_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.current_state().await.network_down);
    }

    #[test]
    fn throttle_interval_caps_at_max() {
        let config = OverlayConfig::default();
        // 1.5s * 3^3 = 40.5s, capped to 15s per §8 scenario S5.
        let ms = throttle_interval_ms(&config, 3);
        assert_eq!(ms, config.sg_max_interval_ms);
    }
}
