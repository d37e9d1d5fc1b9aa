use crate::helpers::E_TIMEOUT;
use crate::tracing;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use windows::{
    core::*, Win32::Foundation::*, Win32::System::LibraryLoader::*,
    Win32::System::Threading::GetCurrentThreadId, Win32::UI::Input::KeyboardAndMouse::*,
    Win32::UI::WindowsAndMessaging::*,
};

/// How long `HotkeyMonitor::start` waits for the hook thread to report back.
pub const HOOK_INSTALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ModifierState {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl ModifierState {
    /// Returns false if `vk` isn't a modifier we track.
    fn update(&mut self, vk: u32, key_down: bool) -> bool {
        let flag = match VIRTUAL_KEY(vk as u16) {
            VK_CONTROL | VK_LCONTROL | VK_RCONTROL => &mut self.ctrl,
            VK_MENU | VK_LMENU | VK_RMENU => &mut self.alt,
            VK_SHIFT | VK_LSHIFT | VK_RSHIFT => &mut self.shift,
            _ => return false,
        };
        *flag = key_down;
        true
    }

    pub fn all_down(&self) -> bool {
        self.ctrl && self.alt && self.shift
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HotkeyPhase {
    Idle,
    ArmedByModifiers,
    Triggered,
}

/// Recognizes Ctrl+Alt+Shift+<trigger> from a stream of key events.
#[derive(Clone)]
pub struct HotkeyDetector {
    modifiers: ModifierState,
    trigger_vk: u32,
}

impl HotkeyDetector {
    /// `trigger_key` is an ASCII letter or digit; their virtual-key codes
    /// are the upper-case character.
    pub fn new(trigger_key: char) -> Self {
        HotkeyDetector {
            modifiers: ModifierState::default(),
            trigger_vk: trigger_key.to_ascii_uppercase() as u32,
        }
    }

    #[cfg(test)]
    pub fn modifiers(&self) -> ModifierState {
        self.modifiers
    }

    pub fn on_key(&mut self, vk: u32, key_down: bool) -> HotkeyPhase {
        let is_modifier = self.modifiers.update(vk, key_down);
        if !self.modifiers.all_down() {
            HotkeyPhase::Idle
        } else if !is_modifier && key_down && vk == self.trigger_vk {
            HotkeyPhase::Triggered
        } else {
            HotkeyPhase::ArmedByModifiers
        }
    }
}

/// Set while a switch sequence is in flight. Only `try_begin` sets it; only
/// dropping the token it hands out clears it.
#[derive(Default, Clone)]
pub struct TriggerGuard(Arc<AtomicBool>);

impl TriggerGuard {
    pub fn try_begin(&self) -> Option<TriggerToken> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TriggerToken(self.0.clone()))
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct TriggerToken(Arc<AtomicBool>);

impl Drop for TriggerToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What the hook callback works with. Lives in a thread local of the hook
/// thread, since the callback has no context parameter.
struct HookDispatch {
    detector: HotkeyDetector,
    guard: TriggerGuard,
    worker: Sender<TriggerToken>,
}

impl HookDispatch {
    /// Never blocks: at most flips the guard and posts to the worker.
    fn on_key(&mut self, vk: u32, key_down: bool) {
        if self.detector.on_key(vk, key_down) != HotkeyPhase::Triggered {
            return;
        }
        match self.guard.try_begin() {
            // If the worker is gone the token comes back in the error and
            // is dropped, which frees the guard again.
            Some(token) => _ = self.worker.send(token),
            None => tracing::trace_log_message("trigger ignored, switch already running"),
        }
    }
}

thread_local! {
    static DISPATCH: RefCell<Option<HookDispatch>> = const { RefCell::new(None) };
}

unsafe extern "system" fn low_level_keyboard_proc(
    code: i32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if code == HC_ACTION as i32 {
        let info = &*(lparam.0 as *const KBDLLHOOKSTRUCT);
        let message = wparam.0 as u32;
        let key_down = message == WM_KEYDOWN || message == WM_SYSKEYDOWN;
        DISPATCH.with(|dispatch| {
            if let Ok(mut dispatch) = dispatch.try_borrow_mut() {
                if let Some(dispatch) = dispatch.as_mut() {
                    dispatch.on_key(info.vkCode, key_down);
                }
            }
        });
    }
    // We only watch. Everything goes on to the next hook.
    CallNextHookEx(HHOOK::default(), code, wparam, lparam)
}

/// The hook thread: installs the hook, pumps messages until WM_QUIT, and
/// unhooks. Reports its thread id (or the install error) through `ready`.
fn hook_thread(dispatch: HookDispatch, ready: Sender<std::result::Result<u32, HRESULT>>) {
    DISPATCH.with(|slot| *slot.borrow_mut() = Some(dispatch));

    let hook = unsafe {
        GetModuleHandleW(PCWSTR::null()).and_then(|module| {
            SetWindowsHookExW(
                WH_KEYBOARD_LL,
                Some(low_level_keyboard_proc),
                HINSTANCE(module.0),
                0,
            )
        })
    };
    let hook = match hook {
        Ok(hook) => hook,
        Err(err) => {
            _ = ready.send(Err(err.code()));
            return;
        }
    };

    let mut msg = MSG::default();
    unsafe {
        // Make sure we have a message queue before anybody posts WM_QUIT to us.
        _ = PeekMessageW(&mut msg, HWND::default(), WM_USER, WM_USER, PM_NOREMOVE);
        _ = ready.send(Ok(GetCurrentThreadId()));

        while GetMessageW(&mut msg, HWND::default(), 0, 0).0 > 0 {
            _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
        _ = UnhookWindowsHookEx(hook);
    }
    DISPATCH.with(|slot| slot.borrow_mut().take());
}

/// A running global keyboard hook. Stopped on drop.
pub struct HotkeyMonitor {
    thread_id: u32,
    thread: Option<JoinHandle<()>>,
}

impl HotkeyMonitor {
    /// Starts the hook thread and waits for the hook to be installed.
    /// Triggers show up on `worker` as `TriggerToken`s.
    pub fn start(trigger_key: char, guard: TriggerGuard, worker: Sender<TriggerToken>) -> Result<Self> {
        let dispatch = HookDispatch {
            detector: HotkeyDetector::new(trigger_key),
            guard,
            worker,
        };
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("hotkey".to_owned())
            .spawn(move || hook_thread(dispatch, ready_tx))?;

        match ready_rx.recv_timeout(HOOK_INSTALL_TIMEOUT) {
            Ok(Ok(thread_id)) => Ok(HotkeyMonitor {
                thread_id,
                thread: Some(thread),
            }),
            Ok(Err(hr)) => {
                _ = thread.join();
                Err(hr.into())
            }
            // The thread is stuck somewhere; leave it be.
            Err(_) => Err(E_TIMEOUT.into()),
        }
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            unsafe {
                _ = PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
            }
            _ = thread.join();
        }
    }
}

impl Drop for HotkeyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
