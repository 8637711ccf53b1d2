//! Session context
//!
//! Owns everything one debugging session needs: settings, the patch cache,
//! the background poller, the lifecycle gate and the patch group database.
//! Created once by the front end and passed explicitly to command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};

use super::settings::Settings;
use crate::debug::{DebugStatus, LiveTarget, ProcessStart, StaticPatchSource};
use crate::engine::{
    poll_once, ApplyError, ApplyReport, Applicator, GateOutcome, LifecycleGate, PollOutcome,
    Poller, PollerConfig, PollerHandle,
};
use crate::patch::groups::PatchGroupDb;
use crate::patch::{PatchCache, PatchSnapshot};

/// Where a session keeps its files and how it polls
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub settings_path: PathBuf,
    /// Patch group database; `None` keeps groups in memory only
    pub group_db_path: Option<PathBuf>,
    pub poller: PollerConfig,
    /// Run the background poller (one initial scan happens either way)
    pub background_poll: bool,
}

impl SessionConfig {
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: settings_path.into(),
            group_db_path: None,
            poller: PollerConfig::default(),
            background_poll: true,
        }
    }
}

pub struct Session {
    settings: Settings,
    settings_path: PathBuf,
    cache: Arc<PatchCache>,
    source: Arc<dyn StaticPatchSource>,
    status: Arc<dyn DebugStatus>,
    gate: LifecycleGate,
    groups: PatchGroupDb,
    group_db_path: Option<PathBuf>,
    poller: Option<PollerHandle>,
    terminated: bool,
}

impl Session {
    /// Load settings, run the initial scan and start the poller
    pub fn start(
        config: SessionConfig,
        source: Arc<dyn StaticPatchSource>,
        status: Arc<dyn DebugStatus>,
    ) -> Result<Self> {
        log::info!("Initializing patch session...");
        let settings = Settings::load(&config.settings_path);
        let cache = Arc::new(PatchCache::new());

        let mut gate = LifecycleGate::new(Applicator::new(Arc::clone(&cache), settings.enabled));
        gate.set_primary_patch_address(settings.primary_patch_address);

        let groups = match &config.group_db_path {
            Some(path) => PatchGroupDb::load(path),
            None => PatchGroupDb::new(),
        };

        match poll_once(&cache, source.as_ref(), status.as_ref()) {
            PollOutcome::Refreshed { regions, bytes } => {
                log::info!("Initial scan: {} regions, {} bytes", regions, bytes)
            }
            other => log::warn!("Initial scan did not complete: {:?}", other),
        }

        let poller = if config.background_poll {
            let handle = Poller::spawn(
                config.poller.clone(),
                Arc::clone(&cache),
                Arc::clone(&source),
                Arc::clone(&status),
            )
            .context("Failed to start patch monitoring thread")?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            settings,
            settings_path: config.settings_path,
            cache,
            source,
            status,
            gate,
            groups,
            group_db_path: config.group_db_path,
            poller,
            terminated: false,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn snapshot(&self) -> PatchSnapshot {
        self.cache.read()
    }

    pub fn cache(&self) -> &Arc<PatchCache> {
        &self.cache
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn status(&self) -> &dyn DebugStatus {
        self.status.as_ref()
    }

    pub fn groups(&self) -> &PatchGroupDb {
        &self.groups
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PollerHandle::is_running)
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Turn patching on or off and persist the choice
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.settings.enabled = enabled;
        self.gate.applicator().set_enabled(enabled);
        log::info!(
            "Patching {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.save_settings()
    }

    pub fn set_primary_patch_address(&mut self, address: Option<u64>) -> Result<()> {
        self.settings.primary_patch_address = address;
        self.gate.set_primary_patch_address(address);
        self.save_settings()
    }

    fn save_settings(&self) -> Result<()> {
        self.settings
            .save(&self.settings_path)
            .with_context(|| format!("Failed to save settings to {}", self.settings_path.display()))
    }

    /// Scan now on the calling thread
    pub fn rescan(&self) -> PollOutcome {
        poll_once(&self.cache, self.source.as_ref(), self.status.as_ref())
    }

    /// Ask the background poller to run a cycle now
    pub fn trigger_poll(&self) {
        if let Some(poller) = &self.poller {
            poller.trigger();
        }
    }

    pub fn on_process_start(
        &mut self,
        event: &ProcessStart,
        target: &mut dyn LiveTarget,
    ) -> GateOutcome {
        self.gate.on_process_start(event, target)
    }

    pub fn on_process_exit(&mut self) {
        self.gate.on_process_exit();
        // The static image may have changed while the process ran
        self.trigger_poll();
    }

    /// Apply the cached patches to the current process
    pub fn apply_to_current_process(
        &mut self,
        target: &mut dyn LiveTarget,
    ) -> Option<std::result::Result<ApplyReport, ApplyError>> {
        self.gate.apply_now(target)
    }

    /// Apply one stored patch group to a suspended target
    pub fn apply_group(
        &self,
        target: &mut dyn LiveTarget,
        name: &str,
    ) -> Result<ApplyReport> {
        let group = self
            .groups
            .get(name)
            .with_context(|| format!("No patch group named [{}]", name))?;
        Ok(self.gate.applicator().apply_group(target, name, group)?)
    }

    /// Store the current snapshot as group `name` and save the database
    pub fn capture_group(&mut self, name: &str) -> Result<usize> {
        let snapshot = self.cache.read();
        self.groups.capture_into(name, &snapshot);
        self.save_groups()?;
        Ok(snapshot.len())
    }

    pub fn set_group_enabled(&mut self, name: &str, enabled: bool) -> Result<bool> {
        let found = self.groups.set_enabled(name, enabled);
        if found {
            self.save_groups()?;
        }
        Ok(found)
    }

    fn save_groups(&self) -> Result<()> {
        if let Some(path) = &self.group_db_path {
            self.groups
                .save(path)
                .with_context(|| format!("Failed to save patch groups to {}", path.display()))?;
        }
        Ok(())
    }

    /// Stop the poller and persist settings. Later calls do nothing.
    pub fn term(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        log::info!("Terminating patch session...");
        if let Some(mut poller) = self.poller.take() {
            poller.kill();
        }
        if let Err(e) = self.save_settings() {
            log::error!("{:#}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.term();
    }
}
