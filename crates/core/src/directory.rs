//! Long-lived cache of known displays.
//!
//! The directory enumerates every backend, resolves and deduplicates
//! identities, and merges each pass into a cache where displays are never
//! removed, only marked unavailable once the failure threshold is reached.
//! It also owns the hardware side of the reconciliation stores: the write
//! worker draining the shared outbox and the poll loop feeding readings back.

use crate::availability::AvailabilityTracker;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::debug_report::{BackendReport, DebugReport, DedupEntry, FeatureTestEntry, ResolvedEntry};
use crate::error::{DirectoryError, ErrorEvent, ErrorKind, HardwareError, RefreshStage};
use crate::hardware::{CorrelationData, DisplayBackend, FeatureValue, OsCorrelation, PhysicalDisplayHandle, VcpFeature};
use crate::identity::{deduplicate, IdentityResolver, ResolvedMonitor, TestedMonitor};
use crate::locks::LockRegistry;
use crate::observable::{EventBus, Watch};
use crate::outbox::{WriteOutbox, WriteRequest};
use crate::persist::KnownMonitorStore;
use crate::store::ReconciliationStore;
use crate::{log_debug, log_error, log_info, log_warn};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Directory-facing view of one physical display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub id: String,
    pub runtime_index: usize,
    pub name: String,
    /// Last reading of the controlled feature, in device units.
    pub brightness: Option<u32>,
    pub max_brightness: Option<u32>,
    pub available: bool,
    pub backend: String,
    pub serial_number: Option<String>,
    pub model_name: Option<String>,
    pub manufacturer_id: Option<String>,
}

impl MonitorInfo {
    fn from_resolved(monitor: &ResolvedMonitor, runtime_index: usize, reading: Option<(u32, u32)>) -> Self {
        Self {
            id: monitor.stable_id.clone(),
            runtime_index,
            name: monitor.display_name.clone(),
            brightness: reading.map(|(current, _)| current),
            max_brightness: reading.map(|(_, max)| max),
            available: true,
            backend: monitor.backend.clone(),
            serial_number: monitor.serial_number.clone(),
            model_name: monitor.model_name.clone(),
            manufacturer_id: monitor.manufacturer_id.clone(),
        }
    }

    /// Fields whose change is worth a notification.
    fn observable_key(&self) -> (&str, bool, &str, &str) {
        (&self.id, self.available, &self.backend, &self.name)
    }
}

#[derive(Debug, Clone)]
struct DisplayEntry {
    backend: usize,
    handle: PhysicalDisplayHandle,
}

#[derive(Default)]
struct Cache {
    monitors: Vec<MonitorInfo>,
    handles: HashMap<String, DisplayEntry>,
}

struct Candidate {
    backend: usize,
    position: usize,
    monitor: ResolvedMonitor,
    reading: Option<(u32, u32)>,
}

type RefreshResult = Result<Vec<MonitorInfo>, DirectoryError>;

/// A refresh in progress that late callers wait on instead of starting
/// their own.
struct InFlight {
    result: Mutex<Option<RefreshResult>>,
    done: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self { result: Mutex::new(None), done: Condvar::new() }
    }

    fn wait(&self) -> RefreshResult {
        let mut result = self.result.lock();
        loop {
            if let Some(r) = result.as_ref() {
                return r.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn complete(&self, result: RefreshResult) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

struct Workers {
    shutdown: Sender<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

pub struct MonitorDirectory {
    backends: Vec<Arc<dyn DisplayBackend>>,
    correlation: Option<Arc<dyn OsCorrelation>>,
    resolver: IdentityResolver,
    feature: VcpFeature,
    config: RwLock<SyncConfig>,
    locks: Arc<LockRegistry>,
    outbox: Arc<WriteOutbox>,
    cache: RwLock<Cache>,
    tracker: Mutex<AvailabilityTracker>,
    monitors: Watch<Vec<MonitorInfo>>,
    errors: EventBus<ErrorEvent>,
    stores: RwLock<Vec<Arc<ReconciliationStore>>>,
    known: Option<Arc<KnownMonitorStore>>,
    in_flight: Mutex<Option<Arc<InFlight>>>,
    last_report: Mutex<DebugReport>,
    workers: Mutex<Option<Workers>>,
    shut_down: AtomicBool,
}

impl MonitorDirectory {
    /// Backends without native identification are resolved through the OS
    /// correlation tables when [`with_correlation`](Self::with_correlation)
    /// supplies them.
    pub fn new(backends: Vec<Arc<dyn DisplayBackend>>, config: SyncConfig) -> Self {
        let resolver = backends
            .iter()
            .filter(|b| !b.provides_identification())
            .fold(IdentityResolver::new(), |r, b| r.with_correlated_backend(b.name()));

        Self {
            backends,
            correlation: None,
            resolver,
            feature: VcpFeature::Brightness,
            config: RwLock::new(config.sanitized()),
            locks: Arc::new(LockRegistry::new()),
            outbox: Arc::new(WriteOutbox::new()),
            cache: RwLock::new(Cache::default()),
            tracker: Mutex::new(AvailabilityTracker::new()),
            monitors: Watch::new(Vec::new()),
            errors: EventBus::new(),
            stores: RwLock::new(Vec::new()),
            known: None,
            in_flight: Mutex::new(None),
            last_report: Mutex::new(DebugReport::default()),
            workers: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn OsCorrelation>) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.tracker = Mutex::new(AvailabilityTracker::with_threshold(threshold));
        self
    }

    /// Loads monitors from earlier sessions. They are listed as unavailable
    /// until a refresh confirms them.
    pub fn with_known_monitors(mut self, known: Arc<KnownMonitorStore>) -> Self {
        let monitors: Vec<MonitorInfo> = known
            .known_monitors()
            .into_iter()
            .map(|m| MonitorInfo { available: false, ..m })
            .collect();
        if !monitors.is_empty() {
            log_info!("Restored {} known monitors", monitors.len());
        }
        self.monitors = Watch::new(monitors.clone());
        self.cache.get_mut().monitors = monitors;
        self.known = Some(known);
        self
    }

    pub fn feature(&self) -> VcpFeature {
        self.feature
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Applies new timing. Running loops pick it up on their next cycle.
    pub fn configure(&self, config: SyncConfig) {
        let config = config.sanitized();
        for store in self.stores.read().iter() {
            store.configure(config.store_settings());
        }
        *self.config.write() = config;
    }

    pub fn outbox(&self) -> Arc<WriteOutbox> {
        Arc::clone(&self.outbox)
    }

    pub fn locks(&self) -> Arc<LockRegistry> {
        Arc::clone(&self.locks)
    }

    /// Creates the reconciliation store for `feature`, wired to this
    /// directory's outbox and seeded with persisted values.
    pub fn add_store(&self, feature: VcpFeature, clock: Arc<dyn Clock>) -> Arc<ReconciliationStore> {
        if let Some(existing) = self.store(feature) {
            return existing;
        }
        let store = Arc::new(ReconciliationStore::new(
            feature,
            self.config.read().store_settings(),
            self.outbox(),
            clock,
        ));

        if let Some(known) = &self.known {
            for monitor in self.cache.read().monitors.iter() {
                if let Some(value) = known.last_value(&monitor.id, feature) {
                    let max = if feature == self.feature { monitor.max_brightness.unwrap_or(0) } else { 0 };
                    store.seed(&monitor.id, value, max);
                }
            }
        }

        self.stores.write().push(Arc::clone(&store));
        store
    }

    pub fn store(&self, feature: VcpFeature) -> Option<Arc<ReconciliationStore>> {
        self.stores.read().iter().find(|s| s.feature() == feature).cloned()
    }

    /// Cached monitors, including unavailable ones.
    pub fn get_monitors(&self) -> Vec<MonitorInfo> {
        self.cache.read().monitors.clone()
    }

    pub fn get_monitor(&self, stable_id: &str) -> Option<MonitorInfo> {
        self.cache.read().monitors.iter().find(|m| m.id == stable_id).cloned()
    }

    /// The monitor list now, then again whenever its ids, availability,
    /// backends or names change.
    pub fn subscribe_monitors(&self) -> Receiver<Vec<MonitorInfo>> {
        self.monitors.subscribe()
    }

    pub fn subscribe_errors(&self) -> Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Re-enumerates displays. Concurrent callers share the pass already in
    /// progress.
    pub fn refresh(&self, timeout: Duration) -> RefreshResult {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DirectoryError::ShutDown);
        }

        let (flight, leader) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(InFlight::new());
                    *slot = Some(Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            log_debug!("Joining refresh already in progress");
            return flight.wait();
        }

        let started = Instant::now();
        let mut report = DebugReport {
            generated_at: chrono::Local::now().to_rfc3339(),
            ..DebugReport::default()
        };
        let result = self.refresh_pass(started, timeout, &mut report);

        match &result {
            Ok(monitors) => log_info!(
                "Refresh finished in {}ms: {} monitors ({} available)",
                started.elapsed().as_millis(),
                monitors.len(),
                monitors.iter().filter(|m| m.available).count()
            ),
            Err(e) => {
                log_warn!("Refresh failed: {}", e);
                self.errors.publish(ErrorEvent::from(e));
            }
        }

        report.refresh_outcome = Some(match &result {
            Ok(monitors) => format!("ok: {} monitors", monitors.len()),
            Err(e) => e.to_string(),
        });
        *self.last_report.lock() = report;

        *self.in_flight.lock() = None;
        flight.complete(result.clone());
        result
    }

    /// Like [`refresh`](Self::refresh) but falls back to the cached list on
    /// any error.
    pub fn refresh_or_cached(&self, timeout: Duration) -> Vec<MonitorInfo> {
        self.refresh(timeout).unwrap_or_else(|_| self.get_monitors())
    }

    fn refresh_pass(&self, started: Instant, timeout: Duration, report: &mut DebugReport) -> RefreshResult {
        let deadline = started + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let _global = self.locks.lock_global(deadline).map_err(|held| {
            DirectoryError::LockContentionTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
                held,
            }
        })?;

        let correlation = self.gather_correlation(deadline, report);
        let handles = self.enumerate_all(deadline, timeout_ms, report)?;

        let mut candidates = Vec::with_capacity(handles.len());
        for (position, (backend, mut handle)) in handles.into_iter().enumerate() {
            if handle.edid.is_none() {
                handle.edid = self.read_identification(backend, &handle, deadline);
            }
            let monitor = self.resolver.resolve_one(&handle, &correlation);
            report.resolved.push(ResolvedEntry {
                stable_id: monitor.stable_id.clone(),
                display_name: monitor.display_name.clone(),
                backend: monitor.backend.clone(),
                index: handle.index,
                source: monitor.source,
                unstable: !monitor.source.is_stable(),
            });

            let outcome = self
                .call_backend(backend, deadline, {
                    let handle = handle.clone();
                    let feature = self.feature;
                    move |b: &dyn DisplayBackend| b.read_feature(&handle, feature)
                })
                .ok_or(DirectoryError::RefreshTimeout { stage: RefreshStage::FeatureTest, timeout_ms })?;

            let (reading, failure) = match outcome {
                Ok(FeatureValue::Continuous { current, max }) => (Some((current, max)), None),
                Ok(FeatureValue::NonContinuous) => (None, Some(HardwareError::NonContinuous { code: self.feature.code() })),
                Err(e) => (None, Some(e)),
            };
            report.feature_tests.push(FeatureTestEntry {
                stable_id: monitor.stable_id.clone(),
                backend: monitor.backend.clone(),
                index: handle.index,
                supported: reading.is_some(),
                current: reading.map(|(c, _)| c),
                max: reading.map(|(_, m)| m),
                failure: failure.as_ref().map(|e| e.to_string()),
            });

            candidates.push(Candidate { backend, position, monitor, reading });
        }

        let tested: Vec<TestedMonitor> = candidates
            .iter()
            .map(|c| TestedMonitor { monitor: c.monitor.clone(), feature_supported: c.reading.is_some() })
            .collect();
        let winners = deduplicate(tested);

        let mut readings = Vec::new();
        let mut failed_tests = Vec::new();
        let (monitors, changed) = {
            let mut cache = self.cache.write();
            let mut tracker = self.tracker.lock();
            let Cache { monitors, handles } = &mut *cache;
            let before: Vec<(String, bool, String, String)> = monitors.iter().map(owned_key).collect();
            let mut seen = HashSet::new();

            for (stable_id, winner) in &winners {
                let Some(candidate) = candidates.iter().find(|c| {
                    c.monitor.backend == winner.monitor.backend && c.monitor.handle.index == winner.monitor.handle.index
                }) else {
                    continue;
                };
                seen.insert(stable_id.clone());
                report.dedup_winners.push(DedupEntry {
                    stable_id: stable_id.clone(),
                    backend: winner.monitor.backend.clone(),
                    index: winner.monitor.handle.index,
                    feature_supported: winner.feature_supported,
                    has_identification_blob: winner.monitor.has_identification_blob(),
                });
                handles.insert(
                    stable_id.clone(),
                    DisplayEntry { backend: candidate.backend, handle: winner.monitor.handle.clone() },
                );

                let existing = monitors.iter_mut().find(|m| &m.id == stable_id);
                match (candidate.reading, existing) {
                    (Some(reading), Some(existing)) => {
                        tracker.register_success(stable_id);
                        *existing = MonitorInfo::from_resolved(&winner.monitor, candidate.position, Some(reading));
                        readings.push((stable_id.clone(), reading));
                    }
                    (Some(reading), None) => {
                        tracker.register_success(stable_id);
                        log_info!("New monitor {} ({}) on {}", winner.monitor.display_name, stable_id, winner.monitor.backend);
                        monitors.push(MonitorInfo::from_resolved(&winner.monitor, candidate.position, Some(reading)));
                        readings.push((stable_id.clone(), reading));
                    }
                    (None, Some(existing)) => {
                        let failures = tracker.register_failure(stable_id);
                        if tracker.has_reached_threshold(stable_id) {
                            existing.available = false;
                        }
                        existing.runtime_index = candidate.position;
                        failed_tests.push((stable_id.clone(), failures));
                    }
                    (None, None) => {
                        log_debug!("Ignoring {}: feature test failed and it was never seen working", stable_id);
                    }
                }
            }

            for monitor in monitors.iter_mut().filter(|m| !seen.contains(&m.id)) {
                handles.remove(&monitor.id);
                let failures = tracker.register_failure(&monitor.id);
                if tracker.has_reached_threshold(&monitor.id) {
                    monitor.available = false;
                }
                log_debug!("{} missing from enumeration ({} consecutive)", monitor.id, failures);
            }

            report.availability = tracker.snapshot();
            report.monitors = monitors.clone();
            report.correlation = correlation;

            let after: Vec<(String, bool, String, String)> = monitors.iter().map(owned_key).collect();
            (monitors.clone(), before != after)
        };

        for (stable_id, failures) in failed_tests {
            self.errors.publish(ErrorEvent::for_display(
                ErrorKind::FeatureReadFailure,
                &stable_id,
                format!("{} test failed ({} consecutive)", self.feature.name(), failures),
            ));
        }

        if let Some(store) = self.store(self.feature) {
            for (stable_id, (current, max)) in &readings {
                store.update_real(stable_id, *current, *max);
            }
        }
        let confirmed: Vec<String> = readings.into_iter().map(|(id, _)| id).collect();
        self.read_other_features(&confirmed, deadline);

        if changed {
            log_info!("Monitor list changed");
            self.monitors.set(monitors.clone());
        }
        if let Some(known) = &self.known {
            known.remember_monitors(&monitors);
        }

        Ok(monitors)
    }

    /// Reads the remaining store features of displays that passed the
    /// feature test, so those stores know the device range before a poll.
    fn read_other_features(&self, stable_ids: &[String], deadline: Instant) {
        let stores: Vec<Arc<ReconciliationStore>> = self
            .stores
            .read()
            .iter()
            .filter(|s| s.feature() != self.feature)
            .cloned()
            .collect();
        if stores.is_empty() {
            return;
        }

        let targets: Vec<(String, DisplayEntry)> = {
            let cache = self.cache.read();
            stable_ids
                .iter()
                .filter_map(|id| cache.handles.get(id).map(|entry| (id.clone(), entry.clone())))
                .collect()
        };

        for store in &stores {
            let feature = store.feature();
            for (stable_id, entry) in &targets {
                let handle = entry.handle.clone();
                let outcome = self.call_backend(entry.backend, deadline, move |b: &dyn DisplayBackend| {
                    b.read_feature(&handle, feature)
                });
                match outcome {
                    Some(Ok(FeatureValue::Continuous { current, max })) => store.update_real(stable_id, current, max),
                    Some(Ok(FeatureValue::NonContinuous)) => {
                        log_debug!("{} reports {} as non-continuous", stable_id, feature.name())
                    }
                    Some(Err(e)) => log_debug!("Reading {} of {} during refresh failed: {}", feature.name(), stable_id, e),
                    None => {
                        log_debug!("Out of time reading {} during refresh", feature.name());
                        return;
                    }
                }
            }
        }
    }

    fn gather_correlation(&self, deadline: Instant, report: &mut DebugReport) -> CorrelationData {
        let Some(source) = self.correlation.as_ref().map(Arc::clone) else {
            return CorrelationData::default();
        };

        let outcome = run_with_deadline(deadline, move || -> Result<CorrelationData, HardwareError> {
            Ok(CorrelationData {
                ordinals: source.physical_monitor_ordinals()?,
                registry: source.registry_edid_entries()?,
            })
        });

        let reason = match outcome {
            Some(Ok(data)) => {
                log_debug!(
                    "Correlation: {} ordinals, {} registry entries",
                    data.ordinals.len(),
                    data.registry.len()
                );
                return data;
            }
            Some(Err(e)) => e.to_string(),
            None => "correlation query timed out".to_string(),
        };

        log_warn!("OS correlation unavailable, falling back to handle data: {}", reason);
        report.correlation_error = Some(reason.clone());
        self.errors.publish(ErrorEvent::new(ErrorKind::IdentityResolutionFailure, reason));
        CorrelationData::default()
    }

    fn enumerate_all(
        &self,
        deadline: Instant,
        timeout_ms: u64,
        report: &mut DebugReport,
    ) -> Result<Vec<(usize, PhysicalDisplayHandle)>, DirectoryError> {
        let mut handles = Vec::new();
        let mut failures = Vec::new();

        for (index, backend) in self.backends.iter().enumerate() {
            let outcome = self
                .call_backend(index, deadline, |b: &dyn DisplayBackend| b.enumerate())
                .ok_or(DirectoryError::RefreshTimeout { stage: RefreshStage::Enumeration, timeout_ms })?;

            match outcome {
                Ok(found) => {
                    log_debug!("{} enumerated {} displays", backend.name(), found.len());
                    report.backends.push(BackendReport {
                        name: backend.name().to_string(),
                        provides_identification: backend.provides_identification(),
                        handles: found.clone(),
                        error: None,
                    });
                    handles.extend(found.into_iter().map(|h| (index, h)));
                }
                Err(e) => {
                    log_warn!("{} enumeration failed: {}", backend.name(), e);
                    report.backends.push(BackendReport {
                        name: backend.name().to_string(),
                        provides_identification: backend.provides_identification(),
                        handles: Vec::new(),
                        error: Some(e.to_string()),
                    });
                    failures.push(e.to_string());
                }
            }
        }

        if !self.backends.is_empty() && failures.len() == self.backends.len() {
            return Err(DirectoryError::Enumeration(failures.join("; ")));
        }
        Ok(handles)
    }

    fn read_identification(&self, backend: usize, handle: &PhysicalDisplayHandle, deadline: Instant) -> Option<Vec<u8>> {
        let handle = handle.clone();
        self.call_backend(backend, deadline, move |b: &dyn DisplayBackend| b.read_raw_identification(&handle))
            .flatten()
            .filter(|blob| !blob.is_empty())
    }

    /// Runs a backend call on a helper thread, giving up at `deadline`.
    /// The call itself is not cancelled.
    fn call_backend<T, F>(&self, backend: usize, deadline: Instant, call: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DisplayBackend) -> T + Send + 'static,
    {
        let backend = Arc::clone(self.backends.get(backend)?);
        run_with_deadline(deadline, move || call(backend.as_ref()))
    }

    /// Reads every known display once, skipping displays locked by a write.
    /// Returns how many displays were read.
    pub fn poll_once(&self) -> usize {
        let targets: Vec<(String, DisplayEntry)> = self
            .cache
            .read()
            .handles
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut features = vec![self.feature];
        for store in self.stores.read().iter() {
            if !features.contains(&store.feature()) {
                features.push(store.feature());
            }
        }

        let mut polled = 0;
        let mut changed = false;
        for (stable_id, entry) in targets {
            let Some(backend) = self.backends.get(entry.backend) else { continue };
            let Some(_guard) = self.locks.try_lock_display(&stable_id) else {
                log_debug!("Skipping poll of {}: busy", stable_id);
                continue;
            };
            polled += 1;

            for &feature in &features {
                let reading = match backend.read_feature(&entry.handle, feature) {
                    Ok(value) => value.continuous().ok_or(HardwareError::NonContinuous { code: feature.code() }),
                    Err(e) => Err(e),
                };

                match reading {
                    Ok((current, max)) => {
                        if let Some(store) = self.store(feature) {
                            store.update_real(&stable_id, current, max);
                        }
                        if feature == self.feature {
                            changed |= self.record_poll_success(&stable_id, current, max);
                        }
                    }
                    Err(e) => {
                        log_debug!("Poll of {} {} failed: {}", stable_id, feature.name(), e);
                        self.errors.publish(ErrorEvent::for_display(
                            ErrorKind::FeatureReadFailure,
                            &stable_id,
                            format!("reading {} failed: {}", feature.name(), e),
                        ));
                        if feature == self.feature {
                            changed |= self.record_poll_failure(&stable_id);
                        }
                    }
                }
            }
        }

        if changed {
            let monitors = self.get_monitors();
            self.monitors.set(monitors.clone());
            if let Some(known) = &self.known {
                known.remember_monitors(&monitors);
            }
        }
        polled
    }

    fn record_poll_success(&self, stable_id: &str, current: u32, max: u32) -> bool {
        self.tracker.lock().register_success(stable_id);
        let mut cache = self.cache.write();
        let Some(monitor) = cache.monitors.iter_mut().find(|m| m.id == stable_id) else {
            return false;
        };
        monitor.brightness = Some(current);
        monitor.max_brightness = Some(max);
        let recovered = !monitor.available;
        monitor.available = true;
        if recovered {
            log_info!("{} is available again", stable_id);
        }
        recovered
    }

    fn record_poll_failure(&self, stable_id: &str) -> bool {
        let reached = {
            let mut tracker = self.tracker.lock();
            tracker.register_failure(stable_id);
            tracker.has_reached_threshold(stable_id)
        };
        if !reached {
            return false;
        }
        let mut cache = self.cache.write();
        match cache.monitors.iter_mut().find(|m| m.id == stable_id) {
            Some(monitor) if monitor.available => {
                log_warn!("{} marked unavailable after repeated read failures", stable_id);
                monitor.available = false;
                true
            }
            _ => false,
        }
    }

    /// Performs queued hardware writes. Returns how many succeeded.
    pub fn process_writes(&self, requests: Vec<WriteRequest>) -> usize {
        let lock_timeout = self.config.read().write_lock_timeout();
        let mut written = 0;

        for request in requests {
            if let Some(known) = &self.known {
                known.record_value(&request.stable_id, request.feature, request.value);
            }

            let entry = self.cache.read().handles.get(&request.stable_id).cloned();
            let Some(entry) = entry else {
                log_debug!("No handle for {}; dropping {} write", request.stable_id, request.feature.name());
                continue;
            };
            let Some(backend) = self.backends.get(entry.backend) else { continue };

            let Some(_guard) = self.locks.lock_display(&request.stable_id, lock_timeout) else {
                log_warn!("Timed out waiting for write lock on {}", request.stable_id);
                self.errors.publish(ErrorEvent::for_display(
                    ErrorKind::LockContentionTimeout,
                    &request.stable_id,
                    format!("write lock not acquired within {}ms", lock_timeout.as_millis()),
                ));
                continue;
            };

            match backend.write_feature(&entry.handle, request.feature, request.raw_value) {
                Ok(()) => {
                    log_debug!("Wrote {} = {} to {}", request.feature.name(), request.raw_value, request.stable_id);
                    written += 1;
                }
                Err(e) => {
                    log_error!("Writing {} to {} failed: {}", request.feature.name(), request.stable_id, e);
                    self.errors.publish(ErrorEvent::for_display(
                        ErrorKind::FeatureWriteFailure,
                        &request.stable_id,
                        e.to_string(),
                    ));
                }
            }
        }

        written
    }

    /// Drains the outbox on the calling thread.
    pub fn flush_writes(&self) -> usize {
        self.process_writes(self.outbox.take_all())
    }

    /// Current pipeline snapshot: the last refresh plus live cache, counters
    /// and store state.
    pub fn debug_report(&self) -> DebugReport {
        let mut report = self.last_report.lock().clone();
        if report.generated_at.is_empty() {
            report.generated_at = chrono::Local::now().to_rfc3339();
        }
        report.monitors = self.get_monitors();
        report.availability = self.tracker.lock().snapshot();
        report.stores = self.stores.read().iter().flat_map(|s| s.snapshots()).collect();
        report
    }

    /// Starts the write worker, the poll loop, the refresh timer and every
    /// attached store's enforcement ticker.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if workers.is_some() || self.shut_down.load(Ordering::Acquire) {
            return;
        }

        for store in self.stores.read().iter() {
            store.init();
        }

        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let mut handles = Vec::new();

        let spawned = [
            spawn_worker("ddc-writer", Arc::downgrade(self), |dir| run_writer(dir)),
            spawn_worker("ddc-poll", Arc::downgrade(self), {
                let rx = shutdown_rx.clone();
                move |dir| run_poller(dir, rx)
            }),
            spawn_worker("monitor-refresh", Arc::downgrade(self), {
                let rx = shutdown_rx;
                move |dir| run_refresher(dir, rx)
            }),
        ];
        for result in spawned {
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => log_error!("Failed to start directory worker: {}", e),
            }
        }

        log_info!("Monitor directory started with {} backends", self.backends.len());
        *workers = Some(Workers { shutdown, handles });
    }

    /// Stops every worker and store. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.outbox.close();
        if let Some(workers) = self.workers.lock().take() {
            drop(workers.shutdown);
            let current = thread::current().id();
            for handle in workers.handles {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }

        for store in self.stores.read().iter() {
            store.dispose();
        }
        if let Some(known) = &self.known {
            known.flush();
        }
        log_info!("Monitor directory shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

fn owned_key(monitor: &MonitorInfo) -> (String, bool, String, String) {
    let (id, available, backend, name) = monitor.observable_key();
    (id.to_string(), available, backend.to_string(), name.to_string())
}

fn run_with_deadline<T, F>(deadline: Instant, call: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("ddc-call".into())
        .spawn(move || {
            let _ = tx.send(call());
        });
    if let Err(e) = spawned {
        log_error!("Failed to start hardware call: {}", e);
        return None;
    }
    rx.recv_deadline(deadline).ok()
}

fn spawn_worker<F>(name: &str, directory: Weak<MonitorDirectory>, body: F) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnOnce(Weak<MonitorDirectory>) + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || body(directory))
}

fn run_writer(directory: Weak<MonitorDirectory>) {
    loop {
        let Some(outbox) = directory.upgrade().map(|d| d.outbox()) else { return };
        let requests = outbox.wait_and_take(Duration::from_millis(250));
        if !requests.is_empty() {
            match directory.upgrade() {
                Some(dir) => {
                    dir.process_writes(requests);
                }
                None => return,
            }
        }
        if outbox.is_closed() && outbox.pending_len() == 0 {
            return;
        }
    }
}

fn run_poller(directory: Weak<MonitorDirectory>, shutdown: Receiver<()>) {
    loop {
        let Some(interval) = directory.upgrade().map(|d| d.config().poll_interval()) else { return };
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            default(interval) => {
                let Some(dir) = directory.upgrade() else { return };
                dir.poll_once();
            }
        }
    }
}

fn run_refresher(directory: Weak<MonitorDirectory>, shutdown: Receiver<()>) {
    loop {
        let Some(interval) = directory.upgrade().map(|d| d.config().refresh_interval()) else { return };
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            default(interval) => {
                let Some(dir) = directory.upgrade() else { return };
                let timeout = dir.config().refresh_timeout();
                let _ = dir.refresh(timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, available: bool, brightness: u32) -> MonitorInfo {
        MonitorInfo {
            id: id.into(),
            runtime_index: 0,
            name: "Display 1".into(),
            brightness: Some(brightness),
            max_brightness: Some(100),
            available,
            backend: "sim".into(),
            serial_number: None,
            model_name: None,
            manufacturer_id: None,
        }
    }

    #[test]
    fn brightness_is_not_an_observable_change() {
        assert_eq!(owned_key(&info("a", true, 10)), owned_key(&info("a", true, 90)));
        assert_ne!(owned_key(&info("a", true, 10)), owned_key(&info("a", false, 10)));
    }

    #[test]
    fn deadline_bounds_slow_calls() {
        let started = Instant::now();
        let result = run_with_deadline(started + Duration::from_millis(50), || {
            thread::sleep(Duration::from_millis(500));
            1
        });
        assert_eq!(result, None);
        assert!(started.elapsed() < Duration::from_millis(400));

        assert_eq!(run_with_deadline(Instant::now() + Duration::from_secs(5), || 7), Some(7));
    }

    #[test]
    fn in_flight_result_is_shared() {
        let flight = Arc::new(InFlight::new());
        let waiter = {
            let flight = Arc::clone(&flight);
            thread::spawn(move || flight.wait())
        };
        flight.complete(Ok(vec![info("a", true, 1)]));
        assert_eq!(waiter.join().unwrap().unwrap()[0].id, "a");
        assert_eq!(flight.wait().unwrap().len(), 1);
    }
}
