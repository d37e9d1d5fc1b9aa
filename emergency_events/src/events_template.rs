use win_etw_macros::trace_logging_provider;

#[trace_logging_provider(
    name = "EmergencyDesk",
    guid = "f6b52934-5348-4ee1-95da-1ea1c160c639",
    provider_group_guid = "ffffffff-ffff-ffff-ffff-ffffffffffff"
)]
// tl:{f6b52934-5348-4ee1-95da-1ea1c160c639}

pub trait EmergencyEvents {
    fn message(message: &str);

    // The hotkey fired and the guard was free. `desktop` is the fully
    // qualified target (WinSta\Desktop) read from the settings.
    fn trigger(desktop: &str);

    fn desktop_ensured(desktop: &str, existed: bool, created: bool);

    // attempts: how many connects it took. hresult is 0 on success, otherwise
    // the error that ended the loop (ERROR_TIMEOUT once the bound runs out).
    fn broker_connect(channel: &str, attempts: u32, hresult: i32);

    // Logged on both ends. is_client is false when the service side is the
    // one reporting the result of CreateProcessAsUser.
    fn run_as(
        is_client: bool,
        executable: &str,
        session_id: u32,
        desktop: &str,
        hresult: i32,
    );

    fn client_rejected(channel: &str, client_pid: u32, hresult: i32);
}
