//! Resource IDs for our string table, and the code to load them. The
//! string_resources macro creates a StaticStringResource for each entry; the
//! text after the ID is what we show if the resource can't be loaded. Keep the
//! IDs in sync with emergency.rc.
//!
//! Example usage:
//! let caption = r::IDS_CAPTION.get();

use win32resources::StaticStringResource;
macro_rules! string_resources {
    (
        $(
            $name:ident = $id:expr, $fallback:expr ;
        )*
    ) => {
        $(
            pub static $name: StaticStringResource = StaticStringResource::new($id, $fallback);
        )*
    }
}

string_resources! {
    IDS_CAPTION = 100, "Emergency Desktop";
    IDS_HOOK_INSTALL_FAILED = 101, "Unable to install the keyboard hook.\n\n{0}";
    IDS_SWITCH_FAILED = 102, "Unable to open the emergency desktop {0}.\n\n{1}";
    IDS_REQUIRES_ELEVATION = 103, "Not running as administrator. The hotkey will ask for permission every time it starts the emergency desktop.";
    IDS_EMERGENCY_ACTIVE = 104, "This is the emergency desktop {0}.\n\nPress OK to return to your normal desktop.";
    IDS_ALREADY_RUNNING = 105, "Emergency Desktop is already watching for the hotkey in this session.";
    IDS_SWITCH_CANCELLED = 106, "Switching to the emergency desktop was cancelled.";
    IDS_MONITOR_RUNNING = 107, "Press Ctrl+Alt+Shift+{0} to open the emergency desktop {1}. Press Ctrl+C to stop.";
}
