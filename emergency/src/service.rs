use crate::tracing;
use std::ffi::{OsStr, OsString};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use windows::{core::*, Win32::Foundation::*};
use windows_service::{
    define_windows_service,
    service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl,
        ServiceExitCode, ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
    service_manager::{ServiceManager, ServiceManagerAccess},
};

/// How long a run-as service (or an elevated broker) sits without a client
/// before it exits on its own.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn service_error(err: windows_service::Error) -> Error {
    match err {
        windows_service::Error::Winapi(io) => io.into(),
        other => {
            tracing::trace_log_message(&format!("service API: {other}"));
            E_INVALIDARG.into()
        }
    }
}

/// What the SCM gets as launch arguments, after our own path.
pub fn service_launch_arguments(service_name: &str, parent_pid: u32) -> Vec<OsString> {
    vec![
        "--runas-service".into(),
        service_name.into(),
        "--parent".into(),
        parent_pid.to_string().into(),
    ]
}

/// Registers `service_name` as a demand-start LocalSystem service running
/// ourselves, starts it, and deletes the registration again. The SCM keeps a
/// deleted service alive until it stops, so nothing is left behind once the
/// service exits. Only the process `parent_pid` may talk to it.
pub fn start_transient_service(service_name: &str, parent_pid: u32) -> Result<()> {
    let manager =
        ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CREATE_SERVICE)
            .map_err(service_error)?;

    let info = ServiceInfo {
        name: service_name.into(),
        display_name: service_name.into(),
        service_type: ServiceType::OWN_PROCESS,
        start_type: ServiceStartType::OnDemand,
        error_control: ServiceErrorControl::Ignore,
        executable_path: std::env::current_exe()?,
        launch_arguments: service_launch_arguments(service_name, parent_pid),
        dependencies: vec![],
        // LocalSystem
        account_name: None,
        account_password: None,
    };
    let service = manager
        .create_service(&info, ServiceAccess::START | ServiceAccess::DELETE)
        .map_err(service_error)?;

    let started = service.start::<&OsStr>(&[]).map_err(service_error);
    if let Err(err) = service.delete() {
        tracing::trace_log_message(&format!("DeleteService({service_name}) failed: {err}"));
    }
    started
}

/// Tracks whether a server is busy, and since when it's been idle.
pub struct IdleWatchdog {
    state: Mutex<IdleState>,
}

struct IdleState {
    busy: usize,
    since: Instant,
}

impl Default for IdleWatchdog {
    fn default() -> Self {
        IdleWatchdog {
            state: Mutex::new(IdleState {
                busy: 0,
                since: Instant::now(),
            }),
        }
    }
}

impl IdleWatchdog {
    /// Marks the server busy until the returned guard is dropped.
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.busy += 1;
        ActivityGuard {
            watchdog: self.clone(),
        }
    }

    /// None while busy.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.busy == 0).then(|| now.saturating_duration_since(state.since))
    }

    /// Polls from a background thread; calls `on_idle` once the server has
    /// been idle for `timeout`. `on_idle` is expected to end the process.
    pub fn spawn<F>(self: &Arc<Self>, timeout: Duration, on_idle: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let watchdog = self.clone();
        let poll = (timeout / 10).max(Duration::from_millis(50));
        std::thread::spawn(move || loop {
            std::thread::sleep(poll);
            if watchdog
                .idle_for(Instant::now())
                .is_some_and(|idle| idle >= timeout)
            {
                on_idle();
                return;
            }
        });
    }
}

pub struct ActivityGuard {
    watchdog: Arc<IdleWatchdog>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut state = self
            .watchdog
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.busy = state.busy.saturating_sub(1);
        state.since = Instant::now();
    }
}

enum ServiceEvent {
    Stop,
    Finished(Result<()>),
}

/// Reports our state to the SCM, and lets the serving side ask for a stop.
#[derive(Clone)]
pub struct ServiceStatusReporter {
    handle: ServiceStatusHandle,
    events: Sender<ServiceEvent>,
}

impl ServiceStatusReporter {
    fn set(&self, state: ServiceState, exit_code: ServiceExitCode) {
        let status = ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: state,
            controls_accepted: if state == ServiceState::Running {
                ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
            } else {
                ServiceControlAccept::empty()
            },
            exit_code,
            checkpoint: 0,
            wait_hint: if state == ServiceState::StartPending {
                Duration::from_secs(3)
            } else {
                Duration::default()
            },
            process_id: None,
        };
        if let Err(err) = self.handle.set_service_status(status) {
            tracing::trace_log_message(&format!("SetServiceStatus({state:?}) failed: {err}"));
        }
    }

    pub fn running(&self) {
        self.set(ServiceState::Running, ServiceExitCode::Win32(NO_ERROR.0));
    }

    /// Asks the service thread to report SERVICE_STOPPED, which ends the
    /// process.
    pub fn stop(&self) {
        _ = self.events.send(ServiceEvent::Stop);
    }
}

pub fn exit_code_for(result: &Result<()>) -> ServiceExitCode {
    match result {
        Ok(()) => ServiceExitCode::Win32(NO_ERROR.0),
        Err(err) => WIN32_ERROR::from_error(err).map_or_else(
            || ServiceExitCode::ServiceSpecific(err.code().0 as u32),
            |code| ServiceExitCode::Win32(code.0),
        ),
    }
}

type ServiceBody = Box<dyn Fn(&ServiceStatusReporter) -> Result<()> + Send + Sync>;

struct ServiceContext {
    name: String,
    body: ServiceBody,
}

// The dispatcher only hands service_main its arguments.
static SERVICE: OnceLock<ServiceContext> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

fn service_main(_arguments: Vec<OsString>) {
    let Some(context) = SERVICE.get() else {
        return;
    };
    if let Err(err) = run_service(context) {
        tracing::trace_log_message(&format!("service {} failed: {err}", context.name));
    }
}

fn run_service(context: &'static ServiceContext) -> windows_service::Result<()> {
    let (events_tx, events_rx) = mpsc::channel();

    let control_tx = events_tx.clone();
    let handle = service_control_handler::register(&context.name, move |control| match control {
        ServiceControl::Stop | ServiceControl::Shutdown => {
            _ = control_tx.send(ServiceEvent::Stop);
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
        _ => ServiceControlHandlerResult::NotImplemented,
    })?;

    let reporter = ServiceStatusReporter {
        handle,
        events: events_tx,
    };
    reporter.set(ServiceState::StartPending, ServiceExitCode::Win32(NO_ERROR.0));

    let serving = reporter.clone();
    std::thread::spawn(move || {
        let result = (context.body)(&serving);
        _ = serving.events.send(ServiceEvent::Finished(result));
    });

    let result = match events_rx.recv() {
        Ok(ServiceEvent::Finished(result)) => result,
        Ok(ServiceEvent::Stop) | Err(_) => Ok(()),
    };
    reporter.set(ServiceState::Stopped, exit_code_for(&result));
    Ok(())
}

/// Hands the process to the service control dispatcher. `body` runs on its
/// own thread; it should call `reporter.running()` once clients can connect.
/// The service stops when `body` returns, when the SCM says so, or when
/// somebody calls `reporter.stop()`.
pub fn run_as_service<F>(service_name: &str, body: F) -> Result<()>
where
    F: Fn(&ServiceStatusReporter) -> Result<()> + Send + Sync + 'static,
{
    let context = ServiceContext {
        name: service_name.to_owned(),
        body: Box::new(body),
    };
    if SERVICE.set(context).is_err() {
        return Err(ERROR_SERVICE_ALREADY_RUNNING.to_hresult().into());
    }
    service_dispatcher::start(service_name, ffi_service_main).map_err(service_error)
}
