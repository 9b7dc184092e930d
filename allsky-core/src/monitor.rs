//! The monitoring loop: fetch, classify, decide, publish.
//!
//! One cycle always ends in a published verdict. Every failure stage maps
//! to a fixed degraded verdict so the observatory control system reads an
//! unambiguous unsafe state instead of a stale file:
//!
//! * classifier cannot load      -> `Model Load Failed`, confidence 0.00
//! * transfer fails              -> `Transfer Error`,    confidence 1.00
//! * local image absent          -> `Image Missing`,     confidence 1.00
//! * preprocess/inference error  -> `Runtime Error`,     confidence 0.00
//!
//! The loop itself never exits on errors; only the stop flag ends it.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use image::DynamicImage;
use log::{debug, error, info, warn};

use allsky_utils::{
    config::MonitorSettings,
    status::{Verdict, write_status},
    timing_guard,
};

use crate::{
    classifier::{Classifier, ClassifierLoader},
    decision::{SafeConditionSet, decide},
    fetch::{FetchRequest, ImageSource, fetch_with_retry},
    preprocess::{PreprocessConfig, preprocess_dynamic_image},
};

/// Events emitted after each cycle for observers (a UI, a log follower).
///
/// Delivery is best-effort: a missing or lagging observer never stalls
/// the safety loop.
pub enum MonitorEvent {
    /// The verdict that was just published.
    Verdict(Verdict),
    /// The frame behind the verdict, for display. Not sent on cycles
    /// that failed before an image was decoded.
    Preview(DynamicImage),
}

/// Shared slot holding the current settings snapshot.
///
/// Writers (the CLI, a settings dialog) store a whole new snapshot; the
/// monitor takes one `Arc` per cycle and works from it unchanged, so a
/// mid-cycle reconfiguration only applies from the next cycle on.
#[derive(Clone)]
pub struct SettingsSlot {
    inner: Arc<Mutex<Arc<MonitorSettings>>>,
}

impl SettingsSlot {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(settings))),
        }
    }

    /// Replace the settings; takes effect from the next cycle.
    pub fn store(&self, settings: MonitorSettings) {
        let mut slot = match self.inner.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Arc::new(settings);
    }

    /// The snapshot a cycle should run against.
    pub fn snapshot(&self) -> Arc<MonitorSettings> {
        match self.inner.lock() {
            Ok(slot) => Arc::clone(&slot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// The long-running safety monitor.
pub struct Monitor {
    slot: SettingsSlot,
    source: Box<dyn ImageSource>,
    loader: Box<dyn ClassifierLoader>,
    classifier: Option<Box<dyn Classifier>>,
    loaded_for: Option<Arc<MonitorSettings>>,
    events: Option<mpsc::Sender<MonitorEvent>>,
}

impl Monitor {
    pub fn new(
        slot: SettingsSlot,
        source: Box<dyn ImageSource>,
        loader: Box<dyn ClassifierLoader>,
    ) -> Self {
        Self {
            slot,
            source,
            loader,
            classifier: None,
            loaded_for: None,
            events: None,
        }
    }

    /// Attach an observer channel for verdicts and preview frames.
    pub fn with_observer(mut self, events: mpsc::Sender<MonitorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    /// Drop the loaded classifier; the next cycle reloads it.
    pub fn unload(&mut self) {
        self.classifier = None;
        self.loaded_for = None;
    }

    /// Run cycles until the stop flag is raised.
    pub fn run(&mut self, stop: Arc<AtomicBool>) {
        info!("monitor loop started");
        while !stop.load(Ordering::Relaxed) {
            let settings = self.slot.snapshot();
            let verdict = self.run_cycle();
            debug!(
                "cycle complete: IsSafe={} Condition={}",
                verdict.is_safe, verdict.condition
            );

            // Sleep in short slices so a stop request is honored promptly.
            let deadline = std::time::Instant::now() + settings.poll_interval();
            while std::time::Instant::now() < deadline {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
        info!("monitor loop stopped");
    }

    /// Execute one full cycle and publish its verdict.
    pub fn run_cycle(&mut self) -> Verdict {
        let _guard = timing_guard("allsky_core::cycle", log::Level::Debug);
        let settings = self.slot.snapshot();

        let (verdict, preview) = self.evaluate(&settings);

        if let Err(e) = write_status(&verdict, &settings.status_file_path) {
            // Publishing failed; keep the loop alive and retry next cycle.
            error!(
                "failed to publish status to {}: {e:#}",
                settings.status_file_path.display()
            );
        }

        if let Some(events) = &self.events {
            let _ = events.send(MonitorEvent::Verdict(verdict.clone()));
            if let Some(image) = preview {
                let _ = events.send(MonitorEvent::Preview(image));
            }
        }

        verdict
    }

    fn evaluate(&mut self, settings: &Arc<MonitorSettings>) -> (Verdict, Option<DynamicImage>) {
        // Settings changed since the classifier was loaded: drop it so the
        // new model/labels/input paths apply.
        if let Some(loaded_for) = &self.loaded_for
            && !Arc::ptr_eq(loaded_for, settings)
        {
            debug!("settings changed; unloading classifier");
            self.unload();
        }

        if self.classifier.is_none() {
            match self.loader.load(settings) {
                Ok(classifier) => {
                    self.classifier = Some(classifier);
                    self.loaded_for = Some(Arc::clone(settings));
                }
                Err(e) => {
                    error!("classifier load failed: {e:#}");
                    return (Verdict::failure("Model Load Failed", 0.0), None);
                }
            }
        }

        let request = FetchRequest::from_settings(settings);
        if let Err(e) = fetch_with_retry(self.source.as_ref(), &request) {
            warn!("image transfer failed: {e:#}");
            return (Verdict::failure("Transfer Error", 1.0), None);
        }

        if !settings.local_image_path.exists() {
            warn!(
                "local image {} missing after transfer",
                settings.local_image_path.display()
            );
            return (Verdict::failure("Image Missing", 1.0), None);
        }

        let image = match image::open(&settings.local_image_path) {
            Ok(image) => image,
            Err(e) => {
                error!(
                    "failed to decode {}: {e}",
                    settings.local_image_path.display()
                );
                return (Verdict::failure("Runtime Error", 0.0), None);
            }
        };

        let config = PreprocessConfig::from(settings.as_ref());
        let tensor = match preprocess_dynamic_image(&image, &config) {
            Ok(tensor) => tensor,
            Err(e) => {
                error!("preprocessing failed: {e:#}");
                return (Verdict::failure("Runtime Error", 0.0), Some(image));
            }
        };

        // evaluate() only reaches here with a loaded classifier.
        let Some(classifier) = &self.classifier else {
            return (Verdict::failure("Model Load Failed", 0.0), Some(image));
        };
        let classification = match classifier.classify(&tensor) {
            Ok(classification) => classification,
            Err(e) => {
                error!("inference failed: {e:#}");
                return (Verdict::failure("Runtime Error", 0.0), Some(image));
            }
        };

        let safe = SafeConditionSet::parse(&settings.safe_conditions);
        if safe.is_empty() {
            warn!("safe-condition list is empty; every condition reads as unsafe");
        }
        (decide(&classification, &safe), Some(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_slot_snapshot_is_stable_across_store() {
        let slot = SettingsSlot::new(MonitorSettings::default());
        let before = slot.snapshot();

        let mut changed = MonitorSettings::default();
        changed.host = "10.0.0.9".to_string();
        slot.store(changed);

        let after = slot.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.host, "192.168.1.100");
        assert_eq!(after.host, "10.0.0.9");
    }

    #[test]
    fn snapshots_share_until_store() {
        let slot = SettingsSlot::new(MonitorSettings::default());
        let a = slot.snapshot();
        let b = slot.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
