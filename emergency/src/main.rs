mod broker;
mod context;
mod desktop;
mod elevate_handler;
mod helpers;
mod hotkey;
mod messages;
mod pipe_bindings;
mod pipe_client;
mod pipe_server;
mod r;
mod run_handler;
mod security;
mod service;
mod settings;
#[cfg(test)]
mod tests;
mod tracing;

use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};
use context::EmergencyContext;
use desktop::{
    enumerate_desktops, list_with_default, switch_to_default_desktop, switch_to_desktop,
    Win32DesktopApi,
};
use elevate_handler::{serve_broker, serve_runas_service};
use helpers::*;
use hotkey::HotkeyMonitor;
use run_handler::Win32BrokerPlatform;
use settings::*;
use std::sync::mpsc;
use windows::{
    core::*, Win32::Foundation::*, Win32::System::Threading::*,
    Win32::UI::WindowsAndMessaging::*,
};

const SINGLE_INSTANCE_MUTEX: &str = "Local\\EmergencyDesk.Monitor";

fn emergency_cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .about("Opens an isolated desktop running as SYSTEM on Ctrl+Alt+Shift+P")
        .version(env!("CARGO_PKG_VERSION"))
        .args_conflicts_with_subcommands(true)
        .arg(
            Arg::new("switch")
                .long("switch")
                .value_name("DESKTOP")
                .help("Switch input to DESKTOP, and back when dismissed"),
        )
        .arg(
            Arg::new("new-instance")
                .long("new-instance")
                .action(ArgAction::SetTrue)
                .help("Don't check for another instance in this session"),
        )
        .arg(
            Arg::new("broker")
                .long("broker")
                .action(ArgAction::SetTrue)
                .requires("parent")
                .hide(true),
        )
        .arg(
            Arg::new("runas-service")
                .long("runas-service")
                .value_name("NAME")
                .requires("parent")
                .hide(true),
        )
        .arg(
            Arg::new("parent")
                .long("parent")
                .value_name("PID")
                .value_parser(value_parser!(u32))
                .hide(true),
        )
        .group(
            ArgGroup::new("mode")
                .args(["switch", "broker", "runas-service"])
                .multiple(false),
        )
        .subcommand(
            Command::new("desktop")
                .about("Show or change the emergency desktop")
                .arg(
                    Arg::new("value")
                        .value_name("DESKTOP")
                        .help("WinSta\\Desktop, or a bare desktop name on WinSTA0"),
                ),
        )
        .subcommand(Command::new("desktops").about("List the desktops of this window station"))
}

fn message_box(text: &str, style: MESSAGEBOX_STYLE) {
    unsafe {
        MessageBoxW(
            HWND::default(),
            &HSTRING::from(text),
            &HSTRING::from(r::IDS_CAPTION.get()),
            style | MB_SETFOREGROUND,
        );
    }
}

/// Held for as long as the monitor runs. None if another monitor in this
/// session got there first.
fn acquire_single_instance() -> Result<Option<Owned<HANDLE>>> {
    let mutex = unsafe {
        Owned::new(CreateMutexW(
            None,
            false,
            &HSTRING::from(SINGLE_INSTANCE_MUTEX),
        )?)
    };
    if Error::from_win32().code() == ERROR_ALREADY_EXISTS.to_hresult() {
        return Ok(None);
    }
    Ok(Some(mutex))
}

fn do_monitor(new_instance: bool) -> Result<i32> {
    let _instance = if new_instance {
        None
    } else {
        match acquire_single_instance()? {
            Some(mutex) => Some(mutex),
            None => {
                message_box(r::IDS_ALREADY_RUNNING.get(), MB_OK | MB_ICONINFORMATION);
                return Ok(ERROR_ALREADY_EXISTS.0 as i32);
            }
        }
    };

    if !is_running_elevated()? {
        tracing::trace_log_message("monitor running unelevated");
        eprintln!("{}", r::IDS_REQUIRES_ELEVATION.get());
    }

    let settings = RegistrySettingsStore;
    let trigger_key = get_trigger_key(&settings)?;
    let context = EmergencyContext::new(Win32DesktopApi, Win32BrokerPlatform, Box::new(settings));

    let (worker, triggers) = mpsc::channel();
    let _monitor = match HotkeyMonitor::start(trigger_key, context.guard().clone(), worker) {
        Ok(monitor) => monitor,
        Err(err) => {
            message_box(
                &r::IDS_HOOK_INSTALL_FAILED.format(&[&err.to_string()]),
                MB_OK | MB_ICONERROR,
            );
            return Err(err);
        }
    };

    let target = get_target_desktop(context.settings())
        .map(|path| path.qualified())
        .unwrap_or_else(|_| DEFAULT_DESKTOP.to_owned());
    println!(
        "{}",
        r::IDS_MONITOR_RUNNING.format(&[&trigger_key.to_string(), &target])
    );

    // The hook thread only hands us tokens; the switch itself runs here.
    for token in triggers {
        _ = context.on_trigger(token, |err| {
            if err.code() == E_CANCELLED {
                message_box(r::IDS_SWITCH_CANCELLED.get(), MB_OK | MB_ICONINFORMATION);
                return;
            }
            let target = get_target_desktop(context.settings())
                .map(|path| path.qualified())
                .unwrap_or_else(|_| DEFAULT_DESKTOP.to_owned());
            message_box(
                &r::IDS_SWITCH_FAILED.format(&[&target, &err.to_string()]),
                MB_OK | MB_ICONERROR,
            );
        });
    }
    Ok(0)
}

/// `--switch`: we're the SYSTEM copy, started on the emergency desktop.
fn do_switch(desktop: &str) -> Result<i32> {
    let path = DesktopPath::parse(desktop)?;
    let _desktop = switch_to_desktop(&path.desktop)?;
    message_box(
        &r::IDS_EMERGENCY_ACTIVE.format(&[&path.qualified()]),
        MB_OK | MB_ICONINFORMATION | MB_TOPMOST,
    );
    switch_to_default_desktop()?;
    Ok(0)
}

fn do_desktop_setting(matches: &ArgMatches) -> Result<i32> {
    let settings = RegistrySettingsStore;
    let path = match matches.get_one::<String>("value") {
        Some(value) => set_target_desktop(&settings, value)?,
        None => get_target_desktop(&settings)?,
    };
    println!("{}", path.qualified());
    Ok(0)
}

fn do_list_desktops() -> Result<i32> {
    let names = enumerate_desktops(DEFAULT_WINDOW_STATION)?;
    for name in list_with_default(names, DEFAULT_DESKTOP) {
        println!("{name}");
    }
    Ok(0)
}

fn do_runas_service(service_name: &str, parent_pid: u32) -> Result<i32> {
    let name = service_name.to_owned();
    service::run_as_service(service_name, move |reporter| {
        serve_runas_service(&name, parent_pid, reporter)
    })?;
    Ok(0)
}

fn run(matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("desktop", m)) => return do_desktop_setting(m),
        Some(("desktops", _)) => return do_list_desktops(),
        _ => {}
    }

    let parent_pid = matches.get_one::<u32>("parent").copied();
    if matches.get_flag("broker") {
        let parent_pid = parent_pid.ok_or_else(|| Error::from(E_INVALID_PARAMETER))?;
        serve_broker(parent_pid)?;
        return Ok(0);
    }
    if let Some(service_name) = matches.get_one::<String>("runas-service") {
        let parent_pid = parent_pid.ok_or_else(|| Error::from(E_INVALID_PARAMETER))?;
        return do_runas_service(service_name, parent_pid);
    }
    if let Some(desktop) = matches.get_one::<String>("switch") {
        return do_switch(desktop);
    }
    do_monitor(matches.get_flag("new-instance"))
}

fn main() {
    tracing::enable_tracing();

    let matches = emergency_cli().get_matches();
    let code = match run(&matches) {
        Ok(code) => code,
        Err(err) => {
            tracing::trace_log_message(&format!("exiting with {:?}", err.code()));
            eprintln!("{err}");
            err.code().0
        }
    };
    std::process::exit(code);
}
