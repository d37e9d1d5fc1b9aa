use crate::broker::{BrokerClient, BrokerPlatform, RetryPolicy};
use crate::desktop::{DesktopApi, DesktopManager};
use crate::helpers::{current_session_id, join_args};
use crate::hotkey::{TriggerGuard, TriggerToken};
use crate::messages::{Credential, RunAsRequest};
use crate::settings::{get_target_desktop, DesktopPath, SettingsStore};
use crate::tracing;
use std::time::Duration;
use windows::core::*;

/// How long we keep ignoring the hotkey after a successful launch, while the
/// new instance takes over input.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Everything the monitor needs to run a switch. Created once in main.
pub struct EmergencyContext<D: DesktopApi, P: BrokerPlatform> {
    desktops: DesktopManager<D>,
    broker: BrokerClient<P>,
    settings: Box<dyn SettingsStore>,
    guard: TriggerGuard,
    settle_delay: Duration,
}

impl<D: DesktopApi, P: BrokerPlatform> EmergencyContext<D, P> {
    pub fn new(desktops: D, platform: P, settings: Box<dyn SettingsStore>) -> Self {
        EmergencyContext {
            desktops: DesktopManager::new(desktops),
            broker: BrokerClient::new(platform, RetryPolicy::default()),
            settings,
            guard: TriggerGuard::default(),
            settle_delay: SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn guard(&self) -> &TriggerGuard {
        &self.guard
    }

    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    #[cfg(test)]
    pub fn broker(&self) -> &BrokerClient<P> {
        &self.broker
    }

    #[cfg(test)]
    pub fn desktops(&self) -> &DesktopManager<D> {
        &self.desktops
    }

    /// Start a SYSTEM copy of ourselves on `target` that switches to it.
    pub fn switch_request(&self, target: &DesktopPath) -> Result<RunAsRequest> {
        let exe = std::env::current_exe()?.to_string_lossy().into_owned();
        let desktop_name = target.qualified();
        let command_line = join_args(&[
            exe.as_str(),
            "--switch",
            desktop_name.as_str(),
            "--new-instance",
        ]);
        Ok(RunAsRequest {
            target_executable: exe,
            command_line,
            current_directory: None,
            credential: Credential::local_system(),
            session_id: current_session_id()?,
            desktop_name,
            use_linked_token: false,
        })
    }

    /// The settings are read on every trigger, so a changed desktop takes
    /// effect without restarting the monitor.
    pub fn run_switch_sequence(&self) -> Result<()> {
        let target = get_target_desktop(self.settings.as_ref())?;
        tracing::trace_trigger(&target.qualified());

        let ensured = self.desktops.ensure_desktop(&target.desktop)?;
        tracing::trace_desktop(&target.qualified(), ensured.existed, ensured.created);
        let request = self.switch_request(&target)?;
        self.broker.execute(&request)
    }

    /// Runs one triggered switch. `report_error` is called while the trigger
    /// is still held, so a second hotkey press can't stack up behind an
    /// error dialog. The token is released on every path out of here.
    pub fn on_trigger<F>(&self, token: TriggerToken, report_error: F) -> Result<()>
    where
        F: FnOnce(&Error),
    {
        let _token = token;
        let result = self.run_switch_sequence();
        match &result {
            Ok(()) => std::thread::sleep(self.settle_delay),
            Err(err) => report_error(err),
        }
        result
    }
}
