use crate::helpers::{E_FILENOTFOUND, E_INVALID_PARAMETER};
use windows::core::*;

pub const SETTINGS_KEY: &str = "Software\\EmergencyDesk";
pub const DESKTOP_VALUE: &str = "Desktop";
pub const TRIGGER_KEY_VALUE: &str = "TriggerKey";

pub const DEFAULT_WINDOW_STATION: &str = "WinSTA0";
pub const DEFAULT_DESKTOP: &str = "WinSTA0\\Emergency";
pub const DEFAULT_TRIGGER_KEY: char = 'P';

/// Raw access to the persisted settings. Implementations only read and write
/// strings; defaults and validation are applied by the free functions below.
pub trait SettingsStore: Send + Sync {
    fn get_desktop(&self) -> Result<String>;
    fn set_desktop(&self, value: &str) -> Result<()>;
    fn get_trigger_key(&self) -> Result<String>;
}

#[derive(Default)]
pub struct RegistrySettingsStore;
impl SettingsStore for RegistrySettingsStore {
    fn get_desktop(&self) -> Result<String> {
        windows_registry::CURRENT_USER
            .open(SETTINGS_KEY)
            .and_then(|key| key.get_string(DESKTOP_VALUE))
    }
    fn set_desktop(&self, value: &str) -> Result<()> {
        windows_registry::CURRENT_USER
            .create(SETTINGS_KEY)
            .and_then(|key| key.set_string(DESKTOP_VALUE, value))
    }
    fn get_trigger_key(&self) -> Result<String> {
        windows_registry::CURRENT_USER
            .open(SETTINGS_KEY)
            .and_then(|key| key.get_string(TRIGGER_KEY_VALUE))
    }
}

/// A window-station-qualified desktop name, like `WinSTA0\Emergency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopPath {
    pub window_station: String,
    pub desktop: String,
}

impl DesktopPath {
    /// Splits `WinSta\Desktop`. A bare desktop name lands on the interactive
    /// window station.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (window_station, desktop) = match value.split_once('\\') {
            Some((station, desktop)) => (station, desktop),
            None => (DEFAULT_WINDOW_STATION, value),
        };
        // Desktop names can't contain backslashes, and neither part can be empty.
        if window_station.is_empty() || desktop.is_empty() || desktop.contains('\\') {
            return Err(E_INVALID_PARAMETER.into());
        }
        Ok(DesktopPath {
            window_station: window_station.to_owned(),
            desktop: desktop.to_owned(),
        })
    }

    pub fn qualified(&self) -> String {
        format!("{}\\{}", self.window_station, self.desktop)
    }
}

/// Get the target desktop. If the setting isn't there, we use the default
/// `WinSTA0\Emergency`. Any other failure to read it is an error.
pub fn get_target_desktop(settings: &dyn SettingsStore) -> Result<DesktopPath> {
    match settings.get_desktop() {
        Ok(v) => DesktopPath::parse(&v),
        Err(e) if e.code() == E_FILENOTFOUND => DesktopPath::parse(DEFAULT_DESKTOP),
        Err(e) => Err(e),
    }
}

pub fn set_target_desktop(settings: &dyn SettingsStore, value: &str) -> Result<DesktopPath> {
    let path = DesktopPath::parse(value)?;
    settings.set_desktop(&path.qualified())?;
    Ok(path)
}

/// Get the trigger key as an upper-case ASCII letter or digit. Letters and
/// digits are the only keys whose virtual-key code is their character.
pub fn get_trigger_key(settings: &dyn SettingsStore) -> Result<char> {
    let value = match settings.get_trigger_key() {
        Ok(v) => v,
        Err(e) if e.code() == E_FILENOTFOUND => return Ok(DEFAULT_TRIGGER_KEY),
        Err(e) => return Err(e),
    };
    let mut chars = value.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => Ok(c.to_ascii_uppercase()),
        _ => Err(E_INVALID_PARAMETER.into()),
    }
}
