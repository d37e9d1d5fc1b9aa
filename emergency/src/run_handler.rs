use crate::broker::BrokerPlatform;
use crate::helpers::*;
use crate::messages::RunAsRequest;
use crate::pipe_client::{connect_pipe, PipeChannel};
use crate::security::harden_window_station_and_desktop;
use crate::service::start_transient_service;
use crate::settings::DesktopPath;
use crate::tracing;
use std::env;
use std::ffi::OsStr;
use windows::{core::*, Win32::UI::Shell::*, Win32::UI::WindowsAndMessaging::*};

/// The real thing: named pipes, UAC and the service control manager.
#[derive(Default, Clone, Copy)]
pub struct Win32BrokerPlatform;

impl BrokerPlatform for Win32BrokerPlatform {
    type Channel = PipeChannel;

    fn is_elevated(&self) -> Result<bool> {
        is_running_elevated()
    }

    fn connect(&self, channel: &str) -> Result<PipeChannel> {
        connect_pipe(channel)
    }

    fn launch_elevated_broker(&self) -> Result<()> {
        let exe = env::current_exe()?;
        let args = join_args(&["--broker", "--parent", &std::process::id().to_string()]);
        tracing::trace_log_message(&format!("elevating: {exe:?} {args}"));
        runas_admin(&exe, &args, SW_HIDE)
    }

    fn harden_desktop(&self, desktop_name: &str) -> Result<()> {
        let path = DesktopPath::parse(desktop_name)?;
        let hardened = harden_window_station_and_desktop(&path.window_station, &path.desktop);
        if let Err(err) = &hardened {
            tracing::trace_log_message(&format!(
                "couldn't open up {desktop_name} for SYSTEM: {:?}",
                err.code()
            ));
        }
        hardened
    }

    fn start_runas_service(&self, service_name: &str, _request: &RunAsRequest) -> Result<()> {
        // The service will only talk to the process that started it: us.
        start_transient_service(service_name, std::process::id())
    }
}

fn runas_admin<Exe, Args>(exe: &Exe, args: &Args, show: SHOW_WINDOW_CMD) -> Result<()>
where
    Exe: AsRef<OsStr> + ?Sized,
    Args: AsRef<OsStr> + ?Sized,
{
    runas_admin_impl(exe.as_ref(), args.as_ref(), show)
}

/// ShellExecuteEx with the "runas" verb. If the user says no to the UAC
/// prompt, this fails with ERROR_CANCELLED.
fn runas_admin_impl(exe: &OsStr, args: &OsStr, show: SHOW_WINDOW_CMD) -> Result<()> {
    let cwd = env::current_dir()?;
    let h_exe = HSTRING::from(exe);
    let h_commandline = HSTRING::from(args);
    let h_cwd = HSTRING::from(cwd.as_os_str());
    let mut sei = SHELLEXECUTEINFOW {
        cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
        fMask: SEE_MASK_NOASYNC,
        lpVerb: w!("runas"),
        lpFile: PCWSTR(h_exe.as_ptr()),
        lpParameters: PCWSTR(h_commandline.as_ptr()),
        lpDirectory: PCWSTR(h_cwd.as_ptr()),
        nShow: show.0,
        ..Default::default()
    };
    unsafe { ShellExecuteExW(&mut sei) }
}
