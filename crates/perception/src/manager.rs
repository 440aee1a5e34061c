//! Perception stream manager: one independently scheduled stream per source.
//!
//! Each stream runs its source once at start, then on its cadence: a timer
//! task for periodic sources, a bus subscription for event-driven ones.
//! Snapshots are cached; their SHA-256 is compared with the previous one and
//! `perception:<name>` is emitted only on change.
//!
//! A stream never overlaps itself: a tick that fires while the previous run
//! is still in flight is skipped and counted, not queued. A failing or slow
//! source keeps its previous snapshot; after three consecutive failures its
//! interval doubles (within 30 s to 30 min).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vigil_core::error::PerceptionError;
use vigil_core::event::{Event, EventBus, SubscriptionId, handler};

use crate::source::{Cadence, MAX_INTERVAL, MIN_INTERVAL, SourceSpec};

/// Probe timeout for sources that do not set their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failures before a stream's interval is doubled.
const BREAKER_THRESHOLD: u32 = 3;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// New content; an event was emitted.
    Changed,
    /// Same content as last time; nothing emitted.
    Unchanged,
    /// The previous run was still in flight, or the manager is stopped.
    Skipped,
    /// The source failed or timed out; the previous snapshot is kept.
    Failed,
}

/// Latest snapshot of a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResult {
    pub name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-source performance counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub name: String,
    pub cadence: &'static str,
    /// Current timer period; `None` for event-driven sources
    pub interval_ms: Option<u64>,
    pub runs: u64,
    pub avg_ms: u64,
    pub last_ms: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub skipped_ticks: u64,
}

#[derive(Default)]
struct StreamState {
    content: Option<String>,
    hash: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    runs: u64,
    total_run: Duration,
    last_run: Duration,
    failures: u64,
    consecutive_failures: u32,
    skipped: u64,
}

struct Stream {
    spec: SourceSpec,
    timeout: Duration,
    in_flight: AtomicBool,
    interval: Option<watch::Sender<Duration>>,
    state: Mutex<StreamState>,
}

impl Stream {
    fn name(&self) -> &str {
        self.spec.name()
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        guard(&self.state)
    }

    fn current_interval(&self) -> Option<Duration> {
        self.interval.as_ref().map(|sender| *sender.borrow())
    }
}

/// Clears the in-flight flag however the run ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    bus: Arc<EventBus>,
    default_timeout: Duration,
    streams: Mutex<Vec<Arc<Stream>>>,
    version: AtomicU64,
    last_build_hashes: Mutex<HashMap<String, String>>,
    running: AtomicBool,
    /// Runtime captured by `start`; streams registered later run on it
    runtime: Mutex<Option<Handle>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Inner {
    fn find(&self, name: &str) -> Option<Arc<Stream>> {
        guard(&self.streams)
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }
}

pub struct PerceptionStreamManager {
    inner: Arc<Inner>,
}

impl PerceptionStreamManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_default_timeout(bus, DEFAULT_TIMEOUT)
    }

    pub fn with_default_timeout(bus: Arc<EventBus>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                default_timeout,
                streams: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
                last_build_hashes: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                runtime: Mutex::new(None),
                timers: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Add a source. Disabled sources are ignored. If the manager is already
    /// running, the new source starts immediately on the runtime `start` ran
    /// on, so this may be called from any thread.
    pub fn register(&self, spec: SourceSpec) -> Result<(), PerceptionError> {
        let name = spec.name().to_string();
        if !spec.enabled {
            debug!(source = %name, "Perception source disabled; not registered");
            return Ok(());
        }
        if self.inner.find(&name).is_some() {
            return Err(PerceptionError::Failed {
                source_name: name,
                reason: "a source with this name is already registered".into(),
            });
        }

        let stream = Arc::new(Stream {
            timeout: spec.timeout.unwrap_or(self.inner.default_timeout),
            in_flight: AtomicBool::new(false),
            interval: spec.cadence.interval().map(|period| watch::channel(period).0),
            state: Mutex::new(StreamState::default()),
            spec,
        });
        guard(&self.inner.streams).push(Arc::clone(&stream));
        debug!(source = %name, cadence = stream.spec.cadence.label(), "Perception source registered");

        if self.inner.running.load(Ordering::SeqCst) {
            let runtime = guard(&self.inner.runtime).clone();
            if let Some(handle) = runtime {
                self.schedule(&stream, &handle);
            }
        }
        Ok(())
    }

    /// Run every source once now, then keep each on its cadence.
    /// Calling `start` while running restarts all streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.running.load(Ordering::SeqCst) {
            self.stop();
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let handle = Handle::current();
        *guard(&self.inner.runtime) = Some(handle.clone());
        let streams = guard(&self.inner.streams).clone();
        let mut by_cadence: BTreeMap<&'static str, usize> = BTreeMap::new();
        for stream in &streams {
            *by_cadence.entry(stream.spec.cadence.label()).or_default() += 1;
            self.schedule(stream, &handle);
        }

        if !streams.is_empty() {
            let summary = by_cadence
                .iter()
                .map(|(cadence, n)| format!("{cadence}:{n}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(sources = streams.len(), summary = %summary, "Perception streams started");
        }
    }

    /// Cancel every timer and bus subscription. Cached results are kept.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        for timer in guard(&self.inner.timers).drain(..) {
            timer.abort();
        }
        for id in guard(&self.inner.subscriptions).drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        if was_running {
            info!("Perception streams stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !guard(&self.inner.streams).is_empty()
    }

    /// Bumped every time any source's content changes.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub fn source_names(&self) -> Vec<String> {
        guard(&self.inner.streams)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Latest snapshot of every source that has produced non-empty output.
    pub fn cached_results(&self) -> Vec<CachedResult> {
        guard(&self.inner.streams)
            .iter()
            .filter_map(|stream| {
                let state = stream.state();
                match (&state.content, state.updated_at) {
                    (Some(content), Some(updated_at)) if !content.is_empty() => Some(CachedResult {
                        name: stream.name().to_string(),
                        content: content.clone(),
                        updated_at,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Whether `name`'s content differs from what the last context build saw.
    /// True for sources that have never produced output.
    pub fn has_changed_since_last_build(&self, name: &str) -> bool {
        let Some(stream) = self.inner.find(name) else {
            return true;
        };
        let Some(hash) = stream.state().hash.clone() else {
            return true;
        };
        guard(&self.inner.last_build_hashes).get(name) != Some(&hash)
    }

    /// Record the current hashes as seen by a context build.
    pub fn mark_context_built(&self) {
        let streams = guard(&self.inner.streams).clone();
        let mut seen = guard(&self.inner.last_build_hashes);
        for stream in streams {
            if let Some(hash) = stream.state().hash.clone() {
                seen.insert(stream.name().to_string(), hash);
            }
        }
    }

    /// Change a periodic source's interval, bounded to 30 s to 30 min.
    /// Returns false for unknown or event-driven sources.
    pub fn adjust_interval(&self, name: &str, interval: Duration) -> bool {
        let Some(stream) = self.inner.find(name) else {
            return false;
        };
        let Some(sender) = &stream.interval else {
            return false;
        };
        let bounded = clamp_interval(interval);
        sender.send_replace(bounded);
        info!(source = %name, interval_secs = bounded.as_secs(), "Perception interval adjusted");
        true
    }

    /// Put a periodic source back on its cadence's default interval.
    pub fn restore_default_interval(&self, name: &str) -> bool {
        let Some(stream) = self.inner.find(name) else {
            return false;
        };
        match (&stream.interval, stream.spec.cadence.interval()) {
            (Some(sender), Some(default)) => {
                sender.send_replace(default);
                info!(source = %name, interval_secs = default.as_secs(), "Perception interval restored to default");
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> Vec<SourceStats> {
        guard(&self.inner.streams)
            .iter()
            .map(|stream| {
                let interval_ms = stream.current_interval().map(|d| d.as_millis() as u64);
                let state = stream.state();
                let avg_ms = if state.runs > 0 {
                    (state.total_run.as_millis() / u128::from(state.runs)) as u64
                } else {
                    0
                };
                SourceStats {
                    name: stream.name().to_string(),
                    cadence: stream.spec.cadence.label(),
                    interval_ms,
                    runs: state.runs,
                    avg_ms,
                    last_ms: state.last_run.as_millis() as u64,
                    failures: state.failures,
                    consecutive_failures: state.consecutive_failures,
                    skipped_ticks: state.skipped,
                }
            })
            .collect()
    }

    /// Run one source now, subject to the same no-overlap rule as scheduled
    /// ticks. Works whether or not the manager is started. `None` for an
    /// unknown source.
    pub async fn refresh(&self, name: &str) -> Option<TickOutcome> {
        let stream = self.inner.find(name)?;
        Some(tick(Arc::clone(&self.inner), stream, true).await)
    }

    fn schedule(&self, stream: &Arc<Stream>, handle: &Handle) {
        handle.spawn(tick(Arc::clone(&self.inner), Arc::clone(stream), false));

        if let Some(sender) = &stream.interval {
            let timer = handle.spawn(run_timer(
                Arc::downgrade(&self.inner),
                Arc::clone(stream),
                sender.subscribe(),
            ));
            guard(&self.inner.timers).push(timer);
        } else if let Cadence::EventDriven { trigger } = &stream.spec.cadence {
            let weak = Arc::downgrade(&self.inner);
            let target = Arc::clone(stream);
            let handle = handle.clone();
            let id = self.inner.bus.on(
                trigger.as_str(),
                handler(move |_: &Event| {
                    if let Some(inner) = weak.upgrade() {
                        handle.spawn(tick(inner, Arc::clone(&target), false));
                    }
                }),
            );
            guard(&self.inner.subscriptions).push(id);
        }
    }
}

impl Drop for PerceptionStreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    inner: Weak<Inner>,
    stream: Arc<Stream>,
    mut interval: watch::Receiver<Duration>,
) {
    loop {
        let period = *interval.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                tokio::spawn(tick(inner, Arc::clone(&stream), false));
            }
            changed = interval.changed() => {
                // New period: restart the wait with it
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn tick(inner: Arc<Inner>, stream: Arc<Stream>, manual: bool) -> TickOutcome {
    if !manual && !inner.running.load(Ordering::SeqCst) {
        return TickOutcome::Skipped;
    }
    let name = stream.name().to_string();

    if stream.in_flight.swap(true, Ordering::SeqCst) {
        stream.state().skipped += 1;
        debug!(source = %name, "Previous run still in flight; tick skipped");
        return TickOutcome::Skipped;
    }
    let _in_flight = InFlight(&stream.in_flight);

    let started = Instant::now();
    let result = match tokio::time::timeout(stream.timeout, stream.spec.source.run()).await {
        Ok(result) => result,
        Err(_) => Err(PerceptionError::Timeout {
            source_name: name.clone(),
            timeout_ms: stream.timeout.as_millis() as u64,
        }),
    };
    let elapsed = started.elapsed();

    let content = match result {
        Ok(content) => content,
        Err(e) => {
            warn!(source = %name, error = %e, "Perception source degraded; keeping previous result");
            record_failure(&stream);
            return TickOutcome::Failed;
        }
    };

    let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
    let changed = {
        let mut state = stream.state();
        state.runs += 1;
        state.total_run += elapsed;
        state.last_run = elapsed;
        state.consecutive_failures = 0;
        state.updated_at = Some(Utc::now());
        state.content = Some(content.clone());
        let changed = state.hash.as_deref() != Some(hash.as_str());
        if changed {
            state.hash = Some(hash);
        }
        changed
    };

    if !changed {
        debug!(source = %name, elapsed_ms = elapsed.as_millis() as u64, "Perception unchanged");
        return TickOutcome::Unchanged;
    }

    let version = inner.version.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(source = %name, version, "Perception changed");
    inner
        .bus
        .emit(&format!("perception:{name}"), serde_json::json!({ "content": content }));
    TickOutcome::Changed
}

fn record_failure(stream: &Stream) {
    let tripped = {
        let mut state = stream.state();
        state.failures += 1;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BREAKER_THRESHOLD {
            state.consecutive_failures = 0;
            true
        } else {
            false
        }
    };
    if !tripped {
        return;
    }
    if let Some(sender) = &stream.interval {
        let doubled = clamp_interval(sender.borrow().saturating_mul(2));
        sender.send_replace(doubled);
        warn!(
            source = %stream.name(),
            interval_secs = doubled.as_secs(),
            "Circuit breaker: {BREAKER_THRESHOLD} consecutive failures, interval doubled"
        );
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FnSource;
    use std::sync::atomic::AtomicUsize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// A source whose output is whatever the test last put in the cell.
    fn cell_source(name: &str, cell: &Arc<Mutex<String>>) -> FnSource {
        let cell = Arc::clone(cell);
        FnSource::new(name, move || {
            let value = cell.lock().unwrap().clone();
            async move { Ok(value) }
        })
    }

    fn failing_source(name: &str) -> FnSource {
        let owned = name.to_string();
        FnSource::new(name, move || {
            let source_name = owned.clone();
            async move {
                Err(PerceptionError::Failed {
                    source_name,
                    reason: "sensor crashed".into(),
                })
            }
        })
    }

    fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<(String, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(
            "perception:*",
            handler(move |e: &Event| {
                let content = e.str_field("content").unwrap_or_default().to_string();
                sink.lock().unwrap().push((e.event_type.clone(), content));
            }),
        );
        seen
    }

    fn stats_for(manager: &PerceptionStreamManager, name: &str) -> SourceStats {
        manager
            .stats()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn emits_only_when_content_changes() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder(&bus);
        let cell = Arc::new(Mutex::new("clean".to_string()));
        let manager = PerceptionStreamManager::new(Arc::clone(&bus));
        manager
            .register(SourceSpec::new(cell_source("git", &cell), Cadence::Custom(ms(1_000))))
            .unwrap();

        manager.start();
        tokio::time::sleep(ms(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        *cell.lock().unwrap() = "M src/main.rs".into();
        tokio::time::sleep(ms(1_000)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("perception:git".to_string(), "clean".to_string()),
                ("perception:git".to_string(), "M src/main.rs".to_string()),
            ]
        );
        assert_eq!(manager.version(), 2);
        assert_eq!(stats_for(&manager, "git").runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_source_is_isolated() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder(&bus);
        let cell = Arc::new(Mutex::new("ok".to_string()));
        let manager = PerceptionStreamManager::new(Arc::clone(&bus));
        manager
            .register(SourceSpec::new(failing_source("broken"), Cadence::Custom(ms(1_000))))
            .unwrap();
        manager
            .register(SourceSpec::new(cell_source("tasks", &cell), Cadence::Custom(ms(1_000))))
            .unwrap();

        manager.start();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("perception:tasks".to_string(), "ok".to_string())]
        );
        let cached = manager.cached_results();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "tasks");
        assert_eq!(stats_for(&manager, "broken").failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let bus = Arc::new(EventBus::default());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let slow = FnSource::new("slow", move || {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(ms(2_500)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok("done".to_string())
            }
        });

        let manager = PerceptionStreamManager::new(bus);
        manager
            .register(SourceSpec::new(slow, Cadence::Custom(ms(1_000))))
            .unwrap();
        manager.start();
        tokio::time::sleep(ms(3_100)).await;

        let stats = stats_for(&manager, "slow");
        assert_eq!(stats.skipped_ticks, 2);
        assert_eq!(stats.runs, 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_previous_snapshot() {
        let bus = Arc::new(EventBus::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let flaky = FnSource::new("chrome", move || {
            let first = c.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if !first {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok("tab: inbox".to_string())
            }
        });

        let manager = PerceptionStreamManager::new(bus);
        manager
            .register(
                SourceSpec::new(flaky, Cadence::Custom(ms(1_000))).with_timeout(ms(100)),
            )
            .unwrap();

        assert_eq!(manager.refresh("chrome").await, Some(TickOutcome::Changed));
        assert_eq!(manager.refresh("chrome").await, Some(TickOutcome::Failed));

        let cached = manager.cached_results();
        assert_eq!(cached[0].content, "tab: inbox");
        let stats = stats_for(&manager, "chrome");
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_doubles_interval() {
        let bus = Arc::new(EventBus::default());
        let manager = PerceptionStreamManager::new(bus);
        manager
            .register(SourceSpec::new(failing_source("web"), Cadence::Workspace))
            .unwrap();

        manager.start();
        // Failures at 0 s, 30 s and 60 s trip the breaker.
        tokio::time::sleep(Duration::from_secs(61)).await;

        let stats = stats_for(&manager, "web");
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.interval_ms, Some(60_000));

        // Next attempt now comes 60 s later, not 30 s.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(stats_for(&manager, "web").failures, 3);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(stats_for(&manager, "web").failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn event_driven_source_runs_on_trigger() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder(&bus);
        let cell = Arc::new(Mutex::new("no messages".to_string()));
        let manager = PerceptionStreamManager::new(Arc::clone(&bus));
        manager
            .register(SourceSpec::new(
                cell_source("telegram-inbox", &cell),
                Cadence::EventDriven {
                    trigger: "trigger:telegram".into(),
                },
            ))
            .unwrap();

        manager.start();
        tokio::time::sleep(ms(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        *cell.lock().unwrap() = "1 unread".into();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(seen.lock().unwrap().len(), 1, "no timer for event-driven sources");

        bus.emit_empty("trigger:telegram");
        tokio::time::sleep(ms(10)).await;
        assert_eq!(seen.lock().unwrap()[1].1, "1 unread");

        manager.stop();
        *cell.lock().unwrap() = "2 unread".into();
        bus.emit_empty("trigger:telegram");
        tokio::time::sleep(ms(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(stats_for(&manager, "telegram-inbox").interval_ms, None);
    }

    #[tokio::test]
    async fn change_tracking_across_context_builds() {
        let bus = Arc::new(EventBus::default());
        let cell = Arc::new(Mutex::new("v1".to_string()));
        let manager = PerceptionStreamManager::new(bus);
        manager
            .register(SourceSpec::new(cell_source("state", &cell), Cadence::Workspace))
            .unwrap();

        assert!(manager.has_changed_since_last_build("state"));
        manager.refresh("state").await;
        assert!(manager.has_changed_since_last_build("state"));

        manager.mark_context_built();
        assert!(!manager.has_changed_since_last_build("state"));
        assert_eq!(manager.refresh("state").await, Some(TickOutcome::Unchanged));
        assert!(!manager.has_changed_since_last_build("state"));

        *cell.lock().unwrap() = "v2".into();
        manager.refresh("state").await;
        assert!(manager.has_changed_since_last_build("state"));
        assert_eq!(manager.refresh("missing").await, None);
    }

    #[tokio::test]
    async fn interval_adjustment_is_bounded() {
        let bus = Arc::new(EventBus::default());
        let cell = Arc::new(Mutex::new(String::new()));
        let manager = PerceptionStreamManager::new(bus);
        manager
            .register(SourceSpec::new(cell_source("focus", &cell), Cadence::Browser))
            .unwrap();
        manager
            .register(SourceSpec::new(
                cell_source("chat", &cell),
                Cadence::EventDriven {
                    trigger: "trigger:chat".into(),
                },
            ))
            .unwrap();

        assert!(manager.adjust_interval("focus", Duration::from_secs(1)));
        assert_eq!(stats_for(&manager, "focus").interval_ms, Some(30_000));
        assert!(manager.adjust_interval("focus", Duration::from_secs(7_200)));
        assert_eq!(stats_for(&manager, "focus").interval_ms, Some(1_800_000));
        assert!(manager.restore_default_interval("focus"));
        assert_eq!(stats_for(&manager, "focus").interval_ms, Some(120_000));

        assert!(!manager.adjust_interval("chat", Duration::from_secs(60)));
        assert!(!manager.adjust_interval("unknown", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn registration_rules() {
        let bus = Arc::new(EventBus::default());
        let cell = Arc::new(Mutex::new(String::new()));
        let manager = PerceptionStreamManager::new(bus);

        manager
            .register(SourceSpec::new(cell_source("off", &cell), Cadence::Workspace).disabled())
            .unwrap();
        assert!(manager.source_names().is_empty());
        assert!(!manager.is_active());

        manager
            .register(SourceSpec::new(cell_source("git", &cell), Cadence::Workspace))
            .unwrap();
        let duplicate =
            manager.register(SourceSpec::new(cell_source("git", &cell), Cadence::Heartbeat));
        assert!(duplicate.is_err());
        assert_eq!(manager.source_names(), vec!["git".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn register_from_plain_thread_while_running() {
        let bus = Arc::new(EventBus::default());
        let seen = recorder(&bus);
        let cell = Arc::new(Mutex::new("up".to_string()));
        let manager = Arc::new(PerceptionStreamManager::new(Arc::clone(&bus)));
        manager.start();

        let registrar = Arc::clone(&manager);
        let source = cell_source("uptime", &cell);
        std::thread::spawn(move || {
            registrar.register(SourceSpec::new(source, Cadence::Custom(ms(1_000))))
        })
        .join()
        .unwrap()
        .unwrap();

        tokio::time::sleep(ms(10)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("perception:uptime".to_string(), "up".to_string())]
        );
        assert_eq!(stats_for(&manager, "uptime").runs, 1);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_duplicate_schedules() {
        let bus = Arc::new(EventBus::default());
        let cell = Arc::new(Mutex::new("x".to_string()));
        let manager = PerceptionStreamManager::new(Arc::clone(&bus));
        manager
            .register(SourceSpec::new(
                cell_source("chat", &cell),
                Cadence::EventDriven {
                    trigger: "trigger:chat".into(),
                },
            ))
            .unwrap();
        manager
            .register(SourceSpec::new(cell_source("git", &cell), Cadence::Custom(ms(1_000))))
            .unwrap();

        manager.start();
        manager.start();
        assert!(manager.is_active());
        assert_eq!(bus.subscriber_count(), 1);

        tokio::time::sleep(ms(10)).await;
        let git = stats_for(&manager, "git");
        let before = git.runs + git.skipped_ticks;

        // One live timer ticks once per period; a leaked one would add another.
        tokio::time::sleep(ms(1_000)).await;
        let git = stats_for(&manager, "git");
        assert_eq!(git.runs + git.skipped_ticks - before, 1);

        manager.stop();
        assert!(!manager.is_active());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
