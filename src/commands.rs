use anyhow::{bail, Context, Result};
use crossbeam_channel::{select, unbounded};
use lumensync_core::{
    log_info, log_warn, Config, KnownMonitorStore, MonitorDirectory, MonitorInfo, ReconciliationStore, SyncConfig,
    SystemClock, VcpFeature,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Directory plus both stores, wired to the platform backends.
pub struct Service {
    pub directory: Arc<MonitorDirectory>,
    pub brightness: Arc<ReconciliationStore>,
    pub contrast: Arc<ReconciliationStore>,
    settings: SyncConfig,
}

impl Service {
    pub fn open(config: &Config, settings: SyncConfig) -> Result<Self> {
        let known = Arc::new(
            KnownMonitorStore::open(&config.state_db_path()).context("Failed to open monitor state")?,
        );
        let platform = lumensync_win32::platform();

        let mut directory = MonitorDirectory::new(platform.backends, settings.clone()).with_known_monitors(known);
        if let Some(correlation) = platform.correlation {
            directory = directory.with_correlation(correlation);
        }

        let clock = Arc::new(SystemClock);
        let brightness = directory.add_store(VcpFeature::Brightness, clock.clone());
        let contrast = directory.add_store(VcpFeature::Contrast, clock);

        Ok(Self {
            directory: Arc::new(directory),
            brightness,
            contrast,
            settings,
        })
    }

    fn store(&self, feature: VcpFeature) -> &Arc<ReconciliationStore> {
        match feature {
            VcpFeature::Brightness => &self.brightness,
            VcpFeature::Contrast => &self.contrast,
        }
    }

    fn refresh_timeout(&self) -> Duration {
        self.settings.refresh_timeout()
    }

    pub fn close(&self) {
        self.directory.shutdown();
    }
}

pub fn default_report_path(config: &Config) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    config.data_dir.join(format!("debug-report-{}.json", stamp))
}

fn print_monitors(monitors: &[MonitorInfo]) {
    if monitors.is_empty() {
        println!("No monitors found");
        return;
    }
    for monitor in monitors {
        let level = match (monitor.brightness, monitor.max_brightness) {
            (Some(current), Some(max)) if max > 0 => format!("{:>3}%", current * 100 / max),
            _ => "  -".to_string(),
        };
        println!(
            "{:<2} {:<40} {:<24} {} {}{}",
            monitor.runtime_index,
            monitor.id,
            monitor.name,
            level,
            monitor.backend,
            if monitor.available { "" } else { "  (unavailable)" }
        );
    }
}

pub fn list(service: &Service) -> Result<()> {
    let monitors = service.directory.refresh_or_cached(service.refresh_timeout());
    print_monitors(&monitors);
    Ok(())
}

pub fn refresh(service: &Service) -> Result<()> {
    let monitors = service
        .directory
        .refresh(service.refresh_timeout())
        .context("Refresh failed")?;
    print_monitors(&monitors);
    Ok(())
}

fn resolve_targets(monitors: &[MonitorInfo], target: &str) -> Result<Vec<String>> {
    if target == "all" {
        let ids: Vec<String> = monitors.iter().filter(|m| m.available).map(|m| m.id.clone()).collect();
        if ids.is_empty() {
            bail!("no available monitors");
        }
        return Ok(ids);
    }

    if let Some(monitor) = monitors.iter().find(|m| m.id == target) {
        return Ok(vec![monitor.id.clone()]);
    }
    if let Ok(index) = target.parse::<usize>() {
        if let Some(monitor) = monitors.iter().find(|m| m.runtime_index == index) {
            return Ok(vec![monitor.id.clone()]);
        }
    }
    bail!("unknown monitor '{}'", target)
}

/// Sets the value and keeps the service running until the hardware confirms
/// it or enforcement gives up.
pub fn set(service: &Service, target: &str, value: f64, feature: VcpFeature) -> Result<()> {
    let monitors = service.directory.refresh_or_cached(service.refresh_timeout());
    let ids = resolve_targets(&monitors, target)?;
    let store = service.store(feature);

    service.directory.start();
    for id in &ids {
        store.set_virtual(id, value);
    }

    let settings = store.settings();
    let give_up = Instant::now() + settings.enforcement_duration() + settings.enforcement_interval();
    while store.enforcing_count() > 0 && Instant::now() < give_up {
        thread::sleep(settings.enforcement_interval());
        service.directory.poll_once();
    }

    for id in &ids {
        match store.real_value(id) {
            Some(real) if real.round() == value.round() => println!("{} {} = {}", id, feature.name(), real.round()),
            Some(real) => {
                log_warn!("{} did not confirm {} {} (reads {})", id, feature.name(), value, real);
                println!("{} {} requested {}, display reports {}", id, feature.name(), value, real.round());
            }
            None => println!("{} {} requested {}, no reading", id, feature.name(), value),
        }
    }
    Ok(())
}

pub fn average(service: &Service, ids: &[String]) -> Result<()> {
    service.directory.refresh_or_cached(service.refresh_timeout());
    let unknown: Vec<&String> = ids.iter().filter(|id| service.directory.get_monitor(id).is_none()).collect();
    for id in &unknown {
        log_warn!("Averaging over unknown monitor {}", id);
    }
    println!("{:.1}", service.brightness.get_average(ids));
    Ok(())
}

pub fn debug_export(service: &Service, path: &Path) -> Result<()> {
    service.directory.refresh_or_cached(service.refresh_timeout());
    let report = service.directory.debug_report();
    report.write_to(path)?;
    log_info!("Debug report written to {}", path.display());
    println!("{}", path.display());
    Ok(())
}

/// Runs the background service, printing monitor and error notifications,
/// until `q` is entered or stdin closes.
pub fn watch(service: &Service) -> Result<()> {
    let directory = &service.directory;
    let monitors = directory.subscribe_monitors();
    let errors = directory.subscribe_errors();
    let average_ids: Vec<String> = directory.get_monitors().into_iter().map(|m| m.id).collect();
    let averages = service.brightness.watch_average(&average_ids);

    directory.start();
    let _ = directory.refresh(service.refresh_timeout());

    let (quit_tx, quit_rx) = unbounded::<()>();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim() == "q" => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            let _ = quit_tx.send(());
        })
        .context("Failed to start input thread")?;

    println!("Watching monitors, enter 'q' to stop");
    loop {
        select! {
            recv(quit_rx) -> _ => break,
            recv(monitors) -> update => match update {
                Ok(list) => print_monitors(&list),
                Err(_) => break,
            },
            recv(errors) -> event => if let Ok(event) = event {
                println!("error: {}{}", event.message, event.stable_id.map(|id| format!(" ({})", id)).unwrap_or_default());
            },
            recv(averages) -> average => if let Ok(average) = average {
                println!("average brightness: {:.1}", average);
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: &str, index: usize, available: bool) -> MonitorInfo {
        MonitorInfo {
            id: id.into(),
            runtime_index: index,
            name: "Display".into(),
            brightness: None,
            max_brightness: None,
            available,
            backend: "simulated".into(),
            serial_number: None,
            model_name: None,
            manufacturer_id: None,
        }
    }

    #[test]
    fn targets_resolve_by_id_index_or_all() {
        let monitors = vec![monitor("a", 0, true), monitor("b", 1, false), monitor("c", 2, true)];
        assert_eq!(resolve_targets(&monitors, "all").unwrap(), vec!["a", "c"]);
        assert_eq!(resolve_targets(&monitors, "b").unwrap(), vec!["b"]);
        assert_eq!(resolve_targets(&monitors, "2").unwrap(), vec!["c"]);
        assert!(resolve_targets(&monitors, "z").is_err());
        assert!(resolve_targets(&[monitor("a", 0, false)], "all").is_err());
    }
}
