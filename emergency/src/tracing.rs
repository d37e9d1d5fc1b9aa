use emergency_events::EmergencyEvents;
use windows::core::HRESULT;

// tl:{f6b52934-5348-4ee1-95da-1ea1c160c639}
static EMERGENCY_EVENTS: std::sync::OnceLock<EmergencyEvents> = std::sync::OnceLock::new();

pub fn emergency_events() -> &'static EmergencyEvents {
    EMERGENCY_EVENTS.get_or_init(EmergencyEvents::new)
}

pub fn enable_tracing() {
    emergency_events();
}

pub fn trace_log_message(message: &str) {
    emergency_events().message(None, message);
}

pub fn trace_trigger(desktop: &str) {
    emergency_events().trigger(None, desktop);
}

pub fn trace_desktop(desktop: &str, existed: bool, created: bool) {
    emergency_events().desktop_ensured(None, desktop, existed, created);
}

pub fn trace_connect(channel: &str, attempts: u32, result: HRESULT) {
    emergency_events().broker_connect(None, channel, attempts, result.0);
}

pub fn trace_run_as(
    is_client: bool,
    executable: &str,
    session_id: u32,
    desktop: &str,
    result: HRESULT,
) {
    emergency_events().run_as(None, is_client, executable, session_id, desktop, result.0);
}

pub fn trace_client_rejected(channel: &str, client_pid: u32, result: HRESULT) {
    emergency_events().client_rejected(None, channel, client_pid, result.0);
}
