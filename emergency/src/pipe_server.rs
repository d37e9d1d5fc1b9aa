use crate::helpers::OwnedLocalAlloc;
use crate::messages::BrokerMessage;
use crate::pipe_bindings::{pipe_path, read_message, write_status, MAX_MESSAGE_LEN};
use crate::security::OwnedSecurityDescriptor;
use std::fs::File;
use std::os::windows::io::{AsRawHandle, FromRawHandle};
use windows::{
    core::*, Win32::Foundation::*, Win32::Security::*, Win32::Storage::FileSystem::*,
    Win32::System::Pipes::*, Win32::System::Threading::*,
};

// Clients connect right after the server comes up; 5s is plenty for
// WaitNamedPipe callers, which we don't have anyway.
const DEFAULT_PIPE_TIMEOUT_MS: u32 = 5_000;

/// Who may open the pipe.
pub enum PipeSecurity {
    /// Built in-process, e.g. with `create_security_descriptor_for_process`.
    Descriptor(OwnedSecurityDescriptor),
    /// Parsed from SDDL, LocalFree'd on drop.
    Sddl(OwnedLocalAlloc<PSECURITY_DESCRIPTOR>),
}

impl PipeSecurity {
    fn as_psd(&self) -> PSECURITY_DESCRIPTOR {
        match self {
            PipeSecurity::Descriptor(sd) => sd.as_psd(),
            PipeSecurity::Sddl(sd) => **sd,
        }
    }
}

/// The listening end of a broker channel. One client is served at a time.
pub struct PipeServer {
    channel: String,
    path: HSTRING,
    security: PipeSecurity,
    pending: Option<File>,
}

impl PipeServer {
    /// Creates the first pipe instance right away, so clients can connect as
    /// soon as this returns. Fails if anybody else already owns `channel`.
    pub fn listen(channel: &str, security: PipeSecurity) -> Result<Self> {
        let mut server = PipeServer {
            channel: channel.to_owned(),
            path: HSTRING::from(pipe_path(channel)),
            security,
            pending: None,
        };
        server.pending = Some(server.create_instance(true)?);
        Ok(server)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn create_instance(&self, first: bool) -> Result<File> {
        let sa = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.security.as_psd().0,
            bInheritHandle: FALSE,
        };
        let mut open_mode = PIPE_ACCESS_DUPLEX;
        if first {
            open_mode |= FILE_FLAG_FIRST_PIPE_INSTANCE;
        }

        let handle = unsafe {
            CreateNamedPipeW(
                &self.path,
                open_mode,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                PIPE_UNLIMITED_INSTANCES,
                MAX_MESSAGE_LEN,
                MAX_MESSAGE_LEN,
                DEFAULT_PIPE_TIMEOUT_MS,
                Some(&sa as *const _),
            )
        };
        // CreateNamedPipeW reports failure through an invalid handle, not a Result.
        if handle.is_invalid() {
            return Err(Error::from_win32());
        }
        Ok(unsafe { File::from_raw_handle(handle.0 as _) })
    }

    /// Blocks until a client connects.
    pub fn accept(&mut self) -> Result<PipeConnection> {
        let pipe = match self.pending.take() {
            Some(pipe) => pipe,
            None => self.create_instance(false)?,
        };
        let handle = HANDLE(pipe.as_raw_handle() as _);

        unsafe {
            match ConnectNamedPipe(handle, None) {
                Ok(()) => {}
                // The client beat us to it; that's still a connection.
                Err(err) if err.code() == ERROR_PIPE_CONNECTED.to_hresult() => {}
                Err(err) => return Err(err),
            }
        }

        let mut client_pid = 0u32;
        unsafe { GetNamedPipeClientProcessId(handle, &mut client_pid)? };
        Ok(PipeConnection { pipe, client_pid })
    }
}

pub struct PipeConnection {
    pipe: File,
    client_pid: u32,
}

impl PipeConnection {
    pub fn client_pid(&self) -> u32 {
        self.client_pid
    }

    /// Opens the client process for the checks in `helpers::check_client_*`.
    pub fn open_client(&self) -> Result<Owned<HANDLE>> {
        unsafe {
            Ok(Owned::new(OpenProcess(
                PROCESS_QUERY_LIMITED_INFORMATION,
                false,
                self.client_pid,
            )?))
        }
    }

    /// Tells a client we won't serve it, then hangs up.
    pub fn reject(mut self, reason: &Error) {
        _ = write_status(&mut self.pipe, reason.code());
    }

    /// Answers messages until the client hangs up. Each message gets exactly
    /// one status back; a message we can't decode gets the decode error.
    pub fn serve<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(BrokerMessage) -> Result<()>,
    {
        while let Some(payload) = read_message(&mut self.pipe)? {
            let status = match BrokerMessage::decode(&payload).and_then(&mut handler) {
                Ok(()) => S_OK,
                Err(err) => err.code(),
            };
            write_status(&mut self.pipe, status)?;
        }
        Ok(())
    }
}
