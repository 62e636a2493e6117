//! Virtual/real value reconciliation for one VCP feature.
//!
//! `virtual_value` is what the user asked for and is updated synchronously so
//! every surface sees it at once. `real_value` is what the hardware last
//! reported. Writes toward the virtual value go through a per-display
//! throttle, and an enforcement task re-posts the latest target on an
//! interval until a poll confirms it or the enforcement window closes.

use crate::clock::Clock;
use crate::config::StoreSettings;
use crate::hardware::VcpFeature;
use crate::observable::Watch;
use crate::outbox::{WriteOutbox, WriteRequest};
use crate::{log_debug, log_info};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

/// Device units assumed until a poll reports the real maximum.
pub const DEFAULT_MAX_RAW: u32 = 100;

#[derive(Debug, Clone)]
struct FeatureState {
    real_value: f64,
    virtual_value: f64,
    last_user_update_at: Option<Instant>,
    max_raw_value: u32,
    last_write_at: Option<Instant>,
}

impl FeatureState {
    fn new() -> Self {
        Self {
            real_value: 0.0,
            virtual_value: 0.0,
            last_user_update_at: None,
            max_raw_value: DEFAULT_MAX_RAW,
            last_write_at: None,
        }
    }
}

/// While present in the task map the store keeps retrying `target_value`.
/// Removing the entry is the cancellation.
#[derive(Debug, Clone)]
struct EnforcementTask {
    target_value: f64,
    started_at: Instant,
    last_attempt_at: Instant,
    retries: u32,
}

struct AverageView {
    ids: Vec<String>,
    watch: Watch<f64>,
}

#[derive(Default)]
struct StoreState {
    displays: HashMap<String, FeatureState>,
    tasks: HashMap<String, EnforcementTask>,
    views: Vec<AverageView>,
}

impl StoreState {
    fn average(&self, ids: &[String]) -> f64 {
        if ids.is_empty() {
            return 0.0;
        }
        let sum: f64 = ids
            .iter()
            .map(|id| self.displays.get(id).map_or(0.0, |s| s.virtual_value))
            .sum();
        sum / ids.len() as f64
    }

    fn publish_views(&mut self) {
        let averages: Vec<f64> = self.views.iter().map(|v| self.average(&v.ids)).collect();
        for (view, average) in self.views.iter().zip(averages) {
            view.watch.set(average);
        }
        self.views.retain(|v| v.watch.subscriber_count() > 0);
    }
}

/// Read-only copy of one display's state, for callers and the debug report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSnapshot {
    pub stable_id: String,
    pub feature: VcpFeature,
    pub real_value: f64,
    pub virtual_value: f64,
    pub max_raw_value: u32,
    pub enforcing: bool,
    #[serde(skip)]
    pub last_user_update_at: Option<Instant>,
}

struct Ticker {
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct ReconciliationStore {
    feature: VcpFeature,
    clock: Arc<dyn Clock>,
    outbox: Arc<WriteOutbox>,
    settings: Mutex<StoreSettings>,
    state: Mutex<StoreState>,
    ticker: Mutex<Option<Ticker>>,
    disposed: AtomicBool,
}

impl ReconciliationStore {
    pub fn new(feature: VcpFeature, settings: StoreSettings, outbox: Arc<WriteOutbox>, clock: Arc<dyn Clock>) -> Self {
        Self {
            feature,
            clock,
            outbox,
            settings: Mutex::new(settings.clamped()),
            state: Mutex::new(StoreState::default()),
            ticker: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn feature(&self) -> VcpFeature {
        self.feature
    }

    pub fn settings(&self) -> StoreSettings {
        *self.settings.lock()
    }

    /// Replaces throttle and enforcement timing; values are clamped.
    pub fn configure(&self, settings: StoreSettings) {
        let settings = settings.clamped();
        log_info!(
            "{} store: throttle {}ms, enforcement {}ms every {}ms",
            self.feature.name(),
            settings.throttle_ms,
            settings.enforcement_duration_ms,
            settings.enforcement_interval_ms
        );
        *self.settings.lock() = settings;
    }

    /// Starts the enforcement ticker. Calling it twice is a no-op.
    pub fn init(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.disposed.load(Ordering::Acquire) {
            return;
        }

        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("{}-enforcement", self.feature.name()))
            .spawn(move || run_ticker(weak, shutdown_rx));

        match handle {
            Ok(handle) => *ticker = Some(Ticker { shutdown, handle }),
            Err(e) => crate::log_error!("Failed to start {} enforcement thread: {}", self.feature.name(), e),
        }
    }

    /// Stops the ticker and cancels every enforcement task. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ticker) = self.ticker.lock().take() {
            drop(ticker.shutdown);
            if ticker.handle.thread().id() != thread::current().id() {
                let _ = ticker.handle.join();
            }
        }
        self.state.lock().tasks.clear();
        log_debug!("{} store disposed", self.feature.name());
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Records user intent for a display and pushes it toward the hardware.
    pub fn set_virtual(&self, stable_id: &str, value: f64) {
        let value = clamp_percent(value);
        let now = self.clock.now();
        let settings = self.settings();
        let disposed = self.is_disposed();

        let mut state = self.state.lock();
        let display = state
            .displays
            .entry(stable_id.to_string())
            .or_insert_with(FeatureState::new);
        display.virtual_value = value;
        display.last_user_update_at = Some(now);

        if !disposed {
            let request = WriteRequest {
                stable_id: stable_id.to_string(),
                feature: self.feature,
                value,
                raw_value: scale_to_raw(value, display.max_raw_value),
            };
            let throttle_open = display
                .last_write_at
                .map_or(true, |at| now.saturating_duration_since(at) >= settings.throttle());
            if throttle_open {
                display.last_write_at = Some(now);
                self.outbox.post(request);
            } else {
                // Inside the window: only a write still waiting for the bus
                // picks up the new value, otherwise enforcement carries it.
                self.outbox.update_pending(request);
            }

            state
                .tasks
                .entry(stable_id.to_string())
                .and_modify(|task| {
                    task.target_value = value;
                    task.started_at = now;
                    task.last_attempt_at = now;
                })
                .or_insert(EnforcementTask {
                    target_value: value,
                    started_at: now,
                    last_attempt_at: now,
                    retries: 0,
                });
        }

        state.publish_views();
    }

    /// Feeds a hardware reading back into the store.
    pub fn update_real(&self, stable_id: &str, raw_value: u32, max_raw_value: u32) {
        let real = normalize(raw_value, max_raw_value);

        let mut state = self.state.lock();
        let was_enforcing = state.tasks.contains_key(stable_id);
        if let Some(task) = state.tasks.get(stable_id) {
            if real.round() == task.target_value.round() {
                log_debug!(
                    "{} on {} reached {} after {} retries",
                    self.feature.name(),
                    stable_id,
                    task.target_value.round(),
                    task.retries
                );
                state.tasks.remove(stable_id);
            }
        }

        let display = state
            .displays
            .entry(stable_id.to_string())
            .or_insert_with(FeatureState::new);
        display.real_value = real;
        if max_raw_value > 0 {
            display.max_raw_value = max_raw_value;
        }
        if !was_enforcing {
            display.virtual_value = real;
            state.publish_views();
        }
    }

    /// Seeds a display with a known value without touching the hardware,
    /// e.g. from persisted state at startup.
    pub fn seed(&self, stable_id: &str, value: f64, max_raw_value: u32) {
        let value = clamp_percent(value);
        let mut state = self.state.lock();
        let display = state
            .displays
            .entry(stable_id.to_string())
            .or_insert_with(FeatureState::new);
        display.real_value = value;
        display.virtual_value = value;
        if max_raw_value > 0 {
            display.max_raw_value = max_raw_value;
        }
        state.publish_views();
    }

    /// One enforcement pass: re-posts due targets and drops expired tasks.
    /// Returns how many writes were posted.
    pub fn run_enforcement(&self) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let now = self.clock.now();
        let settings = self.settings();

        let mut state = self.state.lock();
        let StoreState { displays, tasks, .. } = &mut *state;
        let mut posted = 0;

        tasks.retain(|stable_id, task| {
            if now.saturating_duration_since(task.started_at) >= settings.enforcement_duration() {
                log_debug!(
                    "{} on {}: giving up on {} after {} retries",
                    self.feature.name(),
                    stable_id,
                    task.target_value.round(),
                    task.retries
                );
                return false;
            }
            if now.saturating_duration_since(task.last_attempt_at) < settings.enforcement_interval() {
                return true;
            }

            let display = displays.entry(stable_id.clone()).or_insert_with(FeatureState::new);
            let throttle_open = display
                .last_write_at
                .map_or(true, |at| now.saturating_duration_since(at) >= settings.throttle());
            if throttle_open {
                self.outbox.post(WriteRequest {
                    stable_id: stable_id.clone(),
                    feature: self.feature,
                    value: task.target_value,
                    raw_value: scale_to_raw(task.target_value, display.max_raw_value),
                });
                display.last_write_at = Some(now);
                task.last_attempt_at = now;
                task.retries += 1;
                posted += 1;
            }
            true
        });

        posted
    }

    /// Cancels enforcement for a display. No-op when none is active.
    pub fn cancel_enforcement(&self, stable_id: &str) {
        self.state.lock().tasks.remove(stable_id);
    }

    pub fn is_enforcing(&self, stable_id: &str) -> bool {
        self.state.lock().tasks.contains_key(stable_id)
    }

    pub fn enforcing_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn virtual_value(&self, stable_id: &str) -> Option<f64> {
        self.state.lock().displays.get(stable_id).map(|s| s.virtual_value)
    }

    pub fn real_value(&self, stable_id: &str) -> Option<f64> {
        self.state.lock().displays.get(stable_id).map(|s| s.real_value)
    }

    pub fn snapshot(&self, stable_id: &str) -> Option<FeatureSnapshot> {
        let state = self.state.lock();
        state.displays.get(stable_id).map(|s| FeatureSnapshot {
            stable_id: stable_id.to_string(),
            feature: self.feature,
            real_value: s.real_value,
            virtual_value: s.virtual_value,
            max_raw_value: s.max_raw_value,
            enforcing: state.tasks.contains_key(stable_id),
            last_user_update_at: s.last_user_update_at,
        })
    }

    pub fn snapshots(&self) -> Vec<FeatureSnapshot> {
        let mut ids: Vec<String> = self.state.lock().displays.keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Mean virtual value over `stable_ids`; displays never seen count as 0
    /// and an empty list yields 0.
    pub fn get_average(&self, stable_ids: &[String]) -> f64 {
        self.state.lock().average(stable_ids)
    }

    /// Live view of [`get_average`](Self::get_average): the current average
    /// immediately, then each distinct new average.
    pub fn watch_average(&self, stable_ids: &[String]) -> Receiver<f64> {
        let mut ids = stable_ids.to_vec();
        ids.sort();

        let mut state = self.state.lock();
        if let Some(view) = state.views.iter().find(|v| v.ids == ids) {
            return view.watch.subscribe();
        }
        let watch = Watch::new(state.average(&ids));
        let rx = watch.subscribe();
        state.views.push(AverageView { ids, watch });
        rx
    }

    /// Scales a 0..100 value to device units using the display's last known
    /// maximum.
    pub fn virtual_to_raw(&self, stable_id: &str, virtual_value: f64) -> u32 {
        let max = self
            .state
            .lock()
            .displays
            .get(stable_id)
            .map_or(DEFAULT_MAX_RAW, |s| s.max_raw_value);
        scale_to_raw(clamp_percent(virtual_value), max)
    }

    /// Forgets a display entirely.
    pub fn remove(&self, stable_id: &str) {
        let mut state = self.state.lock();
        state.tasks.remove(stable_id);
        state.displays.remove(stable_id);
        state.publish_views();
    }
}

impl Drop for ReconciliationStore {
    fn drop(&mut self) {
        // Disconnecting the channel is enough for the ticker to exit
        if let Some(ticker) = self.ticker.get_mut().take() {
            drop(ticker.shutdown);
        }
    }
}

fn run_ticker(store: Weak<ReconciliationStore>, shutdown: Receiver<()>) {
    loop {
        let interval = match store.upgrade() {
            Some(store) => store.settings().enforcement_interval(),
            None => return,
        };
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            default(interval) => {
                match store.upgrade() {
                    Some(store) => {
                        store.run_enforcement();
                    }
                    None => return,
                }
            }
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

fn normalize(raw_value: u32, max_raw_value: u32) -> f64 {
    if max_raw_value == 0 {
        return clamp_percent(raw_value as f64);
    }
    clamp_percent(raw_value as f64 * 100.0 / max_raw_value as f64)
}

fn scale_to_raw(value: f64, max_raw_value: u32) -> u32 {
    (value / 100.0 * max_raw_value as f64).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with(settings: StoreSettings) -> (ReconciliationStore, Arc<WriteOutbox>, Arc<ManualClock>) {
        let outbox = Arc::new(WriteOutbox::new());
        let clock = Arc::new(ManualClock::new());
        let store = ReconciliationStore::new(VcpFeature::Brightness, settings, Arc::clone(&outbox), clock.clone());
        (store, outbox, clock)
    }

    fn settings(throttle_ms: u64, duration_ms: u64, interval_ms: u64) -> StoreSettings {
        StoreSettings {
            throttle_ms,
            enforcement_duration_ms: duration_ms,
            enforcement_interval_ms: interval_ms,
        }
    }

    #[test]
    fn set_virtual_is_visible_immediately_and_clamped() {
        let (store, _, _) = store_with(StoreSettings::default());
        store.set_virtual("a", 140.0);
        assert_eq!(store.virtual_value("a"), Some(100.0));
        store.set_virtual("a", -3.0);
        assert_eq!(store.virtual_value("a"), Some(0.0));
        assert!(store.snapshot("a").unwrap().last_user_update_at.is_some());
    }

    #[test]
    fn throttle_window_emits_one_write_with_last_value() {
        let (store, outbox, clock) = store_with(settings(200, 5_000, 500));
        for v in [10.0, 20.0, 30.0, 40.0] {
            store.set_virtual("a", v);
            clock.advance_ms(20);
        }
        let writes = outbox.take_all();
        assert_eq!(writes.len(), 1);
        assert_eq!(outbox.posted_count(), 1);
        assert_eq!(writes[0].value, 40.0);
        assert_eq!(writes[0].raw_value, 40);
    }

    #[test]
    fn write_taken_by_hardware_is_not_rewritten_inside_window() {
        let (store, outbox, clock) = store_with(settings(200, 5_000, 500));
        store.set_virtual("a", 10.0);
        assert_eq!(outbox.take_all().len(), 1);
        clock.advance_ms(50);
        store.set_virtual("a", 60.0);
        assert!(outbox.take_all().is_empty());

        clock.advance_ms(200);
        store.set_virtual("a", 70.0);
        assert_eq!(outbox.take_all()[0].value, 70.0);
    }

    #[test]
    fn throttle_is_per_display() {
        let (store, outbox, _) = store_with(settings(200, 5_000, 500));
        store.set_virtual("a", 10.0);
        store.set_virtual("b", 20.0);
        assert_eq!(outbox.take_all().len(), 2);
    }

    #[test]
    fn confirmation_stops_enforcement() {
        let (store, outbox, clock) = store_with(settings(100, 5_000, 500));
        store.set_virtual("a", 42.0);
        outbox.take_all();
        assert!(store.is_enforcing("a"));

        clock.advance_ms(500);
        assert_eq!(store.run_enforcement(), 1);
        outbox.take_all();

        store.update_real("a", 42, 100);
        assert!(!store.is_enforcing("a"));
        for _ in 0..10 {
            clock.advance_ms(500);
            assert_eq!(store.run_enforcement(), 0);
        }
        assert!(outbox.take_all().is_empty());
    }

    #[test]
    fn enforcement_gives_up_after_duration() {
        let (store, outbox, clock) = store_with(settings(100, 1_000, 300));
        store.set_virtual("a", 80.0);
        outbox.take_all();

        let mut retries = 0;
        for _ in 0..20 {
            clock.advance_ms(300);
            retries += store.run_enforcement();
        }
        let bound = (1_000f64 / 300f64).ceil() as usize;
        assert!(retries <= bound, "{} retries exceeds {}", retries, bound);
        assert!(retries > 0);
        assert!(!store.is_enforcing("a"));
        // The user intent survives giving up
        assert_eq!(store.virtual_value("a"), Some(80.0));
    }

    #[test]
    fn new_target_resets_enforcement_window() {
        let (store, _, clock) = store_with(settings(100, 1_000, 300));
        store.set_virtual("a", 10.0);
        clock.advance_ms(900);
        store.run_enforcement();
        store.set_virtual("a", 20.0);
        clock.advance_ms(900);
        store.run_enforcement();
        assert!(store.is_enforcing("a"));
        assert_eq!(store.enforcing_count(), 1);
    }

    #[test]
    fn stale_poll_does_not_override_pending_intent() {
        let (store, _, _) = store_with(StoreSettings::default());
        store.update_real("a", 30, 100);
        assert_eq!(store.virtual_value("a"), Some(30.0));

        store.set_virtual("a", 70.0);
        store.update_real("a", 30, 100);
        assert_eq!(store.virtual_value("a"), Some(70.0));
        assert_eq!(store.real_value("a"), Some(30.0));
    }

    #[test]
    fn readings_are_normalized_with_device_maximum() {
        let (store, outbox, _) = store_with(StoreSettings::default());
        store.update_real("a", 25, 50);
        assert_eq!(store.virtual_value("a"), Some(50.0));
        assert_eq!(store.virtual_to_raw("a", 60.0), 30);
        assert_eq!(store.virtual_to_raw("unknown", 60.0), 60);

        store.set_virtual("a", 60.0);
        assert_eq!(outbox.take_all()[0].raw_value, 30);
    }

    #[test]
    fn average_of_virtual_values() {
        let (store, _, _) = store_with(StoreSettings::default());
        assert_eq!(store.get_average(&[]), 0.0);
        store.set_virtual("a", 20.0);
        store.set_virtual("b", 80.0);
        assert_eq!(store.get_average(&["a".into(), "b".into()]), 50.0);
    }

    #[test]
    fn average_view_emits_only_distinct_values() {
        let (store, _, _) = store_with(StoreSettings::default());
        store.set_virtual("a", 20.0);
        store.set_virtual("b", 80.0);
        let rx = store.watch_average(&["a".into(), "b".into()]);

        store.set_virtual("a", 30.0);
        store.set_virtual("b", 70.0);
        store.set_virtual("c", 99.0);
        store.set_virtual("a", 40.0);

        let seen: Vec<f64> = rx.try_iter().collect();
        assert_eq!(seen, vec![50.0, 55.0, 50.0, 55.0]);
    }

    #[test]
    fn dispose_cancels_everything_and_is_idempotent() {
        let (store, outbox, clock) = store_with(settings(100, 5_000, 300));
        store.set_virtual("a", 10.0);
        store.set_virtual("b", 10.0);
        outbox.take_all();
        store.dispose();
        store.dispose();
        assert_eq!(store.enforcing_count(), 0);

        clock.advance_ms(300);
        assert_eq!(store.run_enforcement(), 0);
        store.set_virtual("a", 90.0);
        assert!(outbox.take_all().is_empty());
        assert_eq!(store.virtual_value("a"), Some(90.0));
    }

    #[test]
    fn ticker_thread_retries_until_disposed() {
        let outbox = Arc::new(WriteOutbox::new());
        let store = Arc::new(ReconciliationStore::new(
            VcpFeature::Contrast,
            settings(10, 30_000, 100),
            Arc::clone(&outbox),
            Arc::new(crate::clock::SystemClock),
        ));
        store.init();
        store.set_virtual("a", 55.0);

        let mut seen = 0;
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while seen < 2 && Instant::now() < deadline {
            seen += outbox.wait_and_take(std::time::Duration::from_millis(200)).len();
        }
        assert!(seen >= 2);
        store.dispose();
        assert_eq!(store.enforcing_count(), 0);
    }
}
