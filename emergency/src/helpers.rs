use crate::tracing::trace_log_message;
use std::ffi::OsString;
use std::ops::{Deref, DerefMut};
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::SystemServices::{SE_TOKEN_USER, SE_TOKEN_USER_1};
use windows::{core::*, Win32::Foundation::*, Win32::Security::*, Win32::System::Threading::*};

pub const E_FILENOTFOUND: HRESULT = ERROR_FILE_NOT_FOUND.to_hresult();
pub const E_CANCELLED: HRESULT = ERROR_CANCELLED.to_hresult();
pub const E_TIMEOUT: HRESULT = ERROR_TIMEOUT.to_hresult();
pub const E_PIPE_BUSY: HRESULT = ERROR_PIPE_BUSY.to_hresult();
pub const E_BROKEN_PIPE: HRESULT = ERROR_BROKEN_PIPE.to_hresult();
pub const E_INVALID_PARAMETER: HRESULT = ERROR_INVALID_PARAMETER.to_hresult();

/// Length of the random suffix appended to the product tag in run-as service
/// and channel names.
pub const RANDOM_SUFFIX_LEN: usize = 16;

// There can be many different types that need to be LocalFree'd. PWSTR, PSECURITY_DESCRIPTOR
// are distinct types, and there's also *mut ACL which is LocalAlloc'd by SetEntriesInAclW.
// Writing a wrapper trait for each concrete type is verbose, so this calls transmute_copy
// and zeroed. It's ugly and somewhat unsafe, but it's simple and short.
#[repr(transparent)]
pub struct OwnedLocalAlloc<T>(pub T);

impl<T> Default for OwnedLocalAlloc<T> {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl<T> Drop for OwnedLocalAlloc<T> {
    fn drop(&mut self) {
        unsafe {
            let ptr: HLOCAL = std::mem::transmute_copy(self);
            if !ptr.0.is_null() {
                LocalFree(ptr);
            }
        }
    }
}

impl<T> Deref for OwnedLocalAlloc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for OwnedLocalAlloc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub fn is_running_elevated() -> Result<bool> {
    is_process_elevated(unsafe { GetCurrentProcess() })
}

/// process: a non-owning handle opened with at least PROCESS_QUERY_LIMITED_INFORMATION.
pub fn is_process_elevated(process: HANDLE) -> Result<bool> {
    let token = get_process_token(process)?;
    let elevation: TOKEN_ELEVATION = get_token_info(*token)?;
    Ok(elevation.TokenIsElevated != 0)
}

fn get_process_token(process: HANDLE) -> Result<Owned<HANDLE>> {
    let mut token = Owned::default();
    unsafe {
        OpenProcessToken(process, TOKEN_QUERY, &mut *token)?;
    }
    Ok(token)
}

// helper trait to get the TOKEN_INFORMATION_CLASS for a given type
pub trait TokenInfo {
    fn info_class() -> TOKEN_INFORMATION_CLASS;
}
impl TokenInfo for TOKEN_ELEVATION {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenElevation
    }
}
impl TokenInfo for SE_TOKEN_USER {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenUser
    }
}
impl TokenInfo for TOKEN_LINKED_TOKEN {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenLinkedToken
    }
}

pub fn get_token_info<T: TokenInfo>(token: HANDLE) -> Result<T> {
    unsafe {
        let mut info: T = std::mem::zeroed();
        let size = std::mem::size_of::<T>() as u32;
        let mut ret_size = size;
        GetTokenInformation(
            token,
            T::info_class(),
            Some(&mut info as *mut _ as _),
            size,
            &mut ret_size,
        )?;
        Ok(info)
    }
}

pub fn get_sid_for_process(process: HANDLE) -> Result<SE_TOKEN_USER_1> {
    let process_token = get_process_token(process)?;
    let token_user: SE_TOKEN_USER = get_token_info(*process_token)?;
    Ok(token_user.Anonymous2)
}

pub fn current_session_id() -> Result<u32> {
    let mut session_id = 0u32;
    unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id)? };
    Ok(session_id)
}

pub fn get_process_path_from_handle(process: HANDLE) -> Result<PathBuf> {
    let mut buffer = vec![0u16; MAX_PATH as usize];

    // QueryFullProcessImageNameW doesn't tell us how big the buffer needs to
    // be on error, so grow it until the path fits.
    loop {
        let mut len = buffer.len() as u32;
        match unsafe {
            QueryFullProcessImageNameW(
                process,
                Default::default(),
                PWSTR(buffer.as_mut_ptr()),
                &mut len,
            )
        } {
            Ok(()) => return Ok(PathBuf::from(OsString::from_wide(&buffer[..len as usize]))),
            Err(err) if err.code() != ERROR_INSUFFICIENT_BUFFER.to_hresult() => return Err(err),
            Err(_) => buffer.resize(buffer.len() * 2, 0),
        };
    }
}

/// Check that the client process is running the same image as we are.
pub fn check_client_image(client_handle: HANDLE) -> Result<()> {
    let process_path = get_process_path_from_handle(client_handle)?;
    let our_path = std::env::current_exe()?;
    trace_log_message(&format!(
        "{process_path:?} connected to server {our_path:?}"
    ));

    if !process_path
        .as_os_str()
        .eq_ignore_ascii_case(our_path.as_os_str())
    {
        return Err(E_ACCESSDENIED.into());
    }
    Ok(())
}

/// Check that the client runs our image under our own user. This is what the
/// elevated broker requires: it was started over the shoulder of exactly this
/// user, and nobody else gets to drive it.
pub fn check_client_same_user(client_handle: HANDLE) -> Result<()> {
    check_client_image(client_handle)?;

    let mut client_sid = get_sid_for_process(client_handle)?;
    let mut our_sid = get_sid_for_process(unsafe { GetCurrentProcess() })?;
    unsafe {
        // EqualSid hands back FALSE (-> Err(GetLastError())) when they differ,
        // and GetLastError is ERROR_SUCCESS in that case. Don't let that turn
        // into an Ok by accident.
        let client_psid = PSID(&mut client_sid.Buffer as *mut _ as _);
        let our_psid = PSID(&mut our_sid.Buffer as *mut _ as _);
        if EqualSid(client_psid, our_psid).is_err() {
            return Err(E_ACCESSDENIED.into());
        }
    }
    Ok(())
}

/// Check that the client runs our image with an elevated token. The run-as
/// service runs as SYSTEM, so a SID comparison would never match; requiring
/// the caller to be elevated keeps limited callers out.
pub fn check_client_elevated(client_handle: HANDLE) -> Result<()> {
    check_client_image(client_handle)?;
    if !is_process_elevated(client_handle)? {
        return Err(E_ACCESSDENIED.into());
    }
    Ok(())
}

/// Generates `len` random characters from [A-Za-z0-9]. We're using
/// `RtlGenRandom` for the bytes, the same way the standard library does:
/// https://github.com/rust-lang/rust/pull/45370
pub fn random_alphanumeric(len: usize) -> String {
    #[link(name = "advapi32")]
    extern "system" {
        // This function's real name is `RtlGenRandom`.
        fn SystemFunction036(RandomBuffer: *mut u8, RandomBufferLength: u32) -> BOOLEAN;
    }

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    // Largest multiple of the alphabet size that fits a byte. Anything at or
    // above it is thrown away, so every character is equally likely.
    const LIMIT: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

    let mut out = String::with_capacity(len);
    let mut bytes = [0u8; 32];
    while out.len() < len {
        unsafe {
            SystemFunction036(bytes.as_mut_ptr(), bytes.len() as u32);
        }
        for b in bytes.iter().copied().filter(|&b| b < LIMIT) {
            if out.len() == len {
                break;
            }
            out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
        }
    }
    out
}

/// Windows does not actually support distinct command line parameters. They're all just given as a single string.
/// We can't just use `.join(" ")` either, because this breaks arguments with whitespaces. This function handles these details.
pub fn join_args<T: AsRef<str>>(args: &[T]) -> String {
    let mut accumulator = String::with_capacity(
        args.iter()
            .map(|s| s.as_ref().len() + 3)
            .sum::<usize>(),
    );

    // Same quoting rules as CommandLineToArgvW expects: backslashes are only
    // special when they precede a quote (or the closing quote we add).
    for (idx, arg) in args.iter().enumerate() {
        if idx != 0 {
            accumulator.push(' ');
        }

        let str = arg.as_ref();
        let quote = str.is_empty() || str.contains(' ') || str.contains('\t');
        if quote {
            accumulator.push('"');
        }

        let mut backslashes: usize = 0;
        for x in str.chars() {
            if x == '\\' {
                backslashes += 1;
            } else {
                if x == '"' {
                    accumulator.extend(std::iter::repeat('\\').take(backslashes + 1));
                }
                backslashes = 0;
            }
            accumulator.push(x);
        }

        if quote {
            accumulator.extend(std::iter::repeat('\\').take(backslashes));
            accumulator.push('"');
        }
    }

    accumulator
}

/// Joins a list of strings into a single string, each of which is null-terminated (including the final one).
pub fn pack_string_list<T: AsRef<str>>(args: &[T]) -> String {
    let expected_len = args
        .iter()
        .map(|s| s.as_ref().len() + 1)
        .sum::<usize>();

    let mut accumulator = String::with_capacity(expected_len);
    for arg in args {
        accumulator.push_str(arg.as_ref());
        accumulator.push('\0');
    }
    accumulator
}

/// Splits a string generated by `pack_string_list` up again.
pub fn unpack_string_list(packed: &str) -> Vec<String> {
    packed.split_terminator('\0').map(String::from).collect()
}
