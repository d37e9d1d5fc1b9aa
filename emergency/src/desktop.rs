use crate::helpers::E_FILENOTFOUND;
use std::sync::Mutex;
use windows::{
    core::*, Win32::Foundation::*, Win32::System::StationsAndDesktops::*,
};

pub const DEFAULT_DESKTOP_NAME: &str = "Default";

// windows-rs doesn't define these. Same values as winuser.h / winnt.h.
const STANDARD_RIGHTS_REQUIRED: u32 = 0x000F_0000;
pub const DESKTOP_ALL_ACCESS: u32 = STANDARD_RIGHTS_REQUIRED
    | DESKTOP_READOBJECTS.0
    | DESKTOP_CREATEWINDOW.0
    | DESKTOP_CREATEMENU.0
    | DESKTOP_HOOKCONTROL.0
    | DESKTOP_JOURNALRECORD.0
    | DESKTOP_JOURNALPLAYBACK.0
    | DESKTOP_ENUMERATE.0
    | DESKTOP_WRITEOBJECTS.0
    | DESKTOP_SWITCHDESKTOP.0;

/// An open desktop handle. Dropping it closes the handle, which destroys the
/// desktop once nobody else has it open.
#[repr(transparent)]
pub struct OwnedDesktop(pub HDESK);

// An HDESK is a process-wide handle value; CloseDesktop works from any thread
// as long as no thread is still assigned to the desktop.
unsafe impl Send for OwnedDesktop {}

impl Drop for OwnedDesktop {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                _ = CloseDesktop(self.0);
            }
        }
    }
}

#[repr(transparent)]
pub struct OwnedWindowStation(pub HWINSTA);

impl Drop for OwnedWindowStation {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                _ = CloseWindowStation(self.0);
            }
        }
    }
}

/// Opens a desktop of our process' window station.
pub fn open_desktop(name: &str, access: u32) -> Result<OwnedDesktop> {
    let name = HSTRING::from(name);
    let desktop = unsafe { OpenDesktopW(&name, DESKTOP_CONTROL_FLAGS(0), false, access)? };
    Ok(OwnedDesktop(desktop))
}

pub fn open_window_station(name: &str, access: u32) -> Result<OwnedWindowStation> {
    let name = HSTRING::from(name);
    let station = unsafe { OpenWindowStationW(&name, false, access)? };
    Ok(OwnedWindowStation(station))
}

fn create_desktop(name: &str) -> Result<OwnedDesktop> {
    let name = HSTRING::from(name);
    let desktop = unsafe {
        CreateDesktopW(
            &name,
            PCWSTR::null(),
            None,
            DESKTOP_CONTROL_FLAGS(0),
            DESKTOP_ALL_ACCESS,
            None,
        )?
    };
    Ok(OwnedDesktop(desktop))
}

/// The OS operations `DesktopManager` needs. Split out so the manager's
/// bookkeeping can be tested without creating real desktops.
pub trait DesktopApi: Send + Sync {
    type Handle: Send;
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, name: &str) -> Result<Self::Handle>;
}

#[derive(Default)]
pub struct Win32DesktopApi;
impl DesktopApi for Win32DesktopApi {
    type Handle = OwnedDesktop;

    fn exists(&self, name: &str) -> Result<bool> {
        match open_desktop(name, DESKTOP_CREATEWINDOW.0) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == E_FILENOTFOUND => Ok(false),
            // It's there, we're just not allowed to touch it.
            Err(_) => Ok(true),
        }
    }

    fn create(&self, name: &str) -> Result<OwnedDesktop> {
        create_desktop(name)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EnsuredDesktop {
    pub existed: bool,
    pub created: bool,
}

/// Makes sure target desktops exist. Desktops we create stay open for as long
/// as the manager lives: closing the last handle would destroy the desktop
/// out from under the process we're about to start on it.
pub struct DesktopManager<D: DesktopApi> {
    api: D,
    retained: Mutex<Vec<D::Handle>>,
}

impl<D: DesktopApi> DesktopManager<D> {
    pub fn new(api: D) -> Self {
        DesktopManager {
            api,
            retained: Mutex::new(Vec::new()),
        }
    }

    /// `name` is the bare desktop name, without the window station.
    pub fn ensure_desktop(&self, name: &str) -> Result<EnsuredDesktop> {
        // Hold the lock across check-and-create, so two callers can't both
        // decide the desktop is missing.
        let mut retained = self
            .retained
            .lock()
            .map_err(|_| Error::from(ERROR_INVALID_STATE))?;

        if self.api.exists(name)? {
            return Ok(EnsuredDesktop {
                existed: true,
                created: false,
            });
        }

        let handle = self.api.create(name)?;
        retained.push(handle);
        Ok(EnsuredDesktop {
            existed: false,
            created: true,
        })
    }

    #[cfg(test)]
    pub fn retained_count(&self) -> usize {
        self.retained.lock().map(|r| r.len()).unwrap_or_default()
    }
}

/// Makes `name` the input desktop and binds the calling thread to it, so
/// windows we create afterwards show up there. The calling thread must not
/// own any windows or hooks yet.
pub fn switch_to_desktop(name: &str) -> Result<OwnedDesktop> {
    let desktop = match open_desktop(name, DESKTOP_ALL_ACCESS) {
        Ok(desktop) => desktop,
        Err(e) if e.code() == E_FILENOTFOUND => create_desktop(name)?,
        Err(e) => return Err(e),
    };
    unsafe {
        SwitchDesktop(desktop.0)?;
        SetThreadDesktop(desktop.0)?;
    }
    Ok(desktop)
}

/// Hands input back to the interactive `Default` desktop.
pub fn switch_to_default_desktop() -> Result<()> {
    let desktop = open_desktop(DEFAULT_DESKTOP_NAME, DESKTOP_SWITCHDESKTOP.0)?;
    unsafe { SwitchDesktop(desktop.0) }
}

unsafe extern "system" fn enum_desktops_callback(name: PCWSTR, context: LPARAM) -> BOOL {
    let names = &mut *(context.0 as *mut Vec<String>);
    if let Ok(name) = name.to_string() {
        names.push(name);
    }
    TRUE
}

/// Lists the desktops of our window station, qualified with the window
/// station name we were given.
pub fn enumerate_desktops(window_station: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    unsafe {
        let station = GetProcessWindowStation()?;
        EnumDesktopsW(
            station,
            Some(enum_desktops_callback),
            LPARAM(&mut names as *mut _ as _),
        )?;
    }
    Ok(names
        .into_iter()
        .map(|name| format!("{window_station}\\{name}"))
        .collect())
}

/// `names` plus `default`, unless it's already in there. The configured
/// desktop is worth showing even before anything has created it.
pub fn list_with_default(mut names: Vec<String>, default: &str) -> Vec<String> {
    if !names.iter().any(|n| n.eq_ignore_ascii_case(default)) {
        names.push(default.to_owned());
    }
    names
}
