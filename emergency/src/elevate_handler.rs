use crate::broker::{BrokerClient, RetryPolicy, ELEVATION_CHANNEL};
use crate::helpers::*;
use crate::messages::{BrokerMessage, Credential, LogonType, RunAsRequest};
use crate::pipe_server::{PipeConnection, PipeSecurity, PipeServer};
use crate::run_handler::Win32BrokerPlatform;
use crate::security::{create_security_descriptor_for_process, create_service_pipe_security_descriptor};
use crate::service::{IdleWatchdog, ServiceStatusReporter, IDLE_TIMEOUT};
use crate::tracing;
use std::ffi::c_void;
use std::sync::Arc;
use windows::{
    core::*, Win32::Foundation::*, Win32::Security::*, Win32::System::Environment::*,
    Win32::System::Threading::*,
};

/// Splits `DOMAIN\user` at the first backslash. Anything else (a bare name,
/// or a UPN like `user@domain`) has no domain part.
pub fn split_user_name(user_name: &str) -> (Option<&str>, &str) {
    match user_name.split_once('\\') {
        Some((domain, user)) => (Some(domain), user),
        None => (None, user_name),
    }
}

fn is_local_system(domain: Option<&str>, user: &str) -> bool {
    domain.is_some_and(|d| d.eq_ignore_ascii_case("NT AUTHORITY"))
        && user.eq_ignore_ascii_case("SYSTEM")
}

fn duplicate_primary_token(token: HANDLE) -> Result<Owned<HANDLE>> {
    let mut primary = Owned::default();
    unsafe {
        DuplicateTokenEx(
            token,
            TOKEN_ALL_ACCESS,
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut *primary,
        )?;
    }
    Ok(primary)
}

fn open_and_duplicate_token(process: HANDLE) -> Result<Owned<HANDLE>> {
    let mut token = Owned::default();
    unsafe {
        OpenProcessToken(process, TOKEN_DUPLICATE | TOKEN_QUERY, &mut *token)?;
    }
    duplicate_primary_token(*token)
}

fn logon_user(user_name: &str, password: &str, logon_type: LogonType) -> Result<Owned<HANDLE>> {
    let (domain, user) = split_user_name(user_name);
    if is_local_system(domain, user) {
        // We are SYSTEM; our own token is the one they want.
        return open_and_duplicate_token(unsafe { GetCurrentProcess() });
    }

    let user = HSTRING::from(user);
    let domain = domain.map(HSTRING::from);
    let password = HSTRING::from(password);
    let mut token = Owned::default();
    unsafe {
        LogonUserW(
            &user,
            domain.as_ref().map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr())),
            &password,
            LOGON32_LOGON(logon_type.into()),
            LOGON32_PROVIDER_DEFAULT,
            &mut *token,
        )?;
    }
    Ok(token)
}

fn token_for_credential(credential: &Credential) -> Result<Owned<HANDLE>> {
    match credential {
        Credential::Logon {
            user_name,
            password,
            logon_type,
        } => logon_user(user_name, password, *logon_type),
        Credential::ProcessToken { process_id } => {
            let process = unsafe {
                Owned::new(OpenProcess(
                    PROCESS_QUERY_LIMITED_INFORMATION,
                    false,
                    *process_id,
                )?)
            };
            open_and_duplicate_token(*process)
        }
    }
}

/// The full token behind a filtered one, if there is one. Limited tokens of
/// users who aren't admins have no linked token; that's not an error.
fn linked_token_or(token: Owned<HANDLE>) -> Owned<HANDLE> {
    match get_token_info::<TOKEN_LINKED_TOKEN>(*token) {
        Ok(linked) if !linked.LinkedToken.is_invalid() => unsafe { Owned::new(linked.LinkedToken) },
        _ => token,
    }
}

struct EnvironmentBlock(*mut c_void);

impl EnvironmentBlock {
    fn for_token(token: HANDLE) -> Result<Self> {
        let mut block = EnvironmentBlock(std::ptr::null_mut());
        unsafe { CreateEnvironmentBlock(&mut block.0, token, false)? };
        Ok(block)
    }
}

impl Drop for EnvironmentBlock {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                _ = DestroyEnvironmentBlock(self.0);
            }
        }
    }
}

fn create_process_as_user(token: HANDLE, request: &RunAsRequest, environment: &EnvironmentBlock) -> Result<()> {
    let application = HSTRING::from(request.target_executable.as_str());
    let mut command_line: Vec<u16> = request.command_line.encode_utf16().chain(Some(0)).collect();
    let mut desktop: Vec<u16> = request.desktop_name.encode_utf16().chain(Some(0)).collect();
    let current_directory = request.current_directory.as_deref().map(HSTRING::from);

    let startup_info = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        lpDesktop: PWSTR(desktop.as_mut_ptr()),
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    unsafe {
        CreateProcessAsUserW(
            token,
            &application,
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false,
            CREATE_UNICODE_ENVIRONMENT,
            Some(environment.0 as *const c_void),
            current_directory
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
            &startup_info,
            &mut process_info,
        )?;
        // We don't wait on it.
        drop(Owned::new(process_info.hThread));
        drop(Owned::new(process_info.hProcess));
    }
    Ok(())
}

/// Creates the requested process. Runs inside the run-as service, as SYSTEM:
/// that's what lets us put any token into any session.
pub fn invoke_run_as(request: &RunAsRequest) -> Result<()> {
    let result = (|| {
        request.validate()?;
        let mut token = token_for_credential(&request.credential)?;
        if request.use_linked_token {
            token = linked_token_or(token);
        }

        unsafe {
            SetTokenInformation(
                *token,
                TokenSessionId,
                &request.session_id as *const u32 as *const c_void,
                std::mem::size_of::<u32>() as u32,
            )?;
        }

        let environment = EnvironmentBlock::for_token(*token)?;
        create_process_as_user(*token, request, &environment)
    })();

    tracing::trace_run_as(
        false,
        &request.target_executable,
        request.session_id,
        &request.desktop_name,
        result.as_ref().err().map(Error::code).unwrap_or(S_OK),
    );
    result
}

fn validate_client(
    connection: &PipeConnection,
    check: impl FnOnce(HANDLE) -> Result<()>,
) -> Result<()> {
    let client = connection.open_client()?;
    check(*client)
}

fn reject_client(channel: &str, connection: PipeConnection, err: Error) {
    tracing::trace_client_rejected(channel, connection.client_pid(), err.code());
    connection.reject(&err);
}

/// `--broker`: the elevated helper an unelevated monitor starts through UAC.
/// Serves one client (which has to be our own user, running our image) and
/// exits when it hangs up. Exits on its own if nobody shows up.
pub fn serve_broker(parent_pid: u32) -> Result<()> {
    let security = create_security_descriptor_for_process(parent_pid)?;
    let mut server = PipeServer::listen(ELEVATION_CHANNEL, PipeSecurity::Descriptor(security))?;

    let watchdog = Arc::new(IdleWatchdog::default());
    watchdog.spawn(IDLE_TIMEOUT, || {
        tracing::trace_log_message("broker: nobody connected, exiting");
        std::process::exit(0)
    });

    loop {
        let mut connection = server.accept()?;
        let _busy = watchdog.begin();
        if let Err(err) = validate_client(&connection, check_client_same_user) {
            reject_client(server.channel(), connection, err);
            continue;
        }

        let client = BrokerClient::new(Win32BrokerPlatform, RetryPolicy::default());
        return connection.serve(|message| match message {
            BrokerMessage::ExecuteRunAs {
                service_name,
                request,
            } => client.execute_in_process(&service_name, &request),
            BrokerMessage::InvokeRunAs(_) => Err(E_INVALID_PARAMETER.into()),
        });
    }
}

/// `--runas-service`: the body of the transient LocalSystem service. Only the
/// process that registered us may connect, and it has to be elevated.
pub fn serve_runas_service(
    service_name: &str,
    parent_pid: u32,
    reporter: &ServiceStatusReporter,
) -> Result<()> {
    let security = create_service_pipe_security_descriptor()?;
    let mut server = PipeServer::listen(service_name, PipeSecurity::Sddl(security))?;
    reporter.running();

    let watchdog = Arc::new(IdleWatchdog::default());
    let idle_reporter = reporter.clone();
    watchdog.spawn(IDLE_TIMEOUT, move || idle_reporter.stop());

    loop {
        let mut connection = server.accept()?;
        let _busy = watchdog.begin();

        let validation = if connection.client_pid() != parent_pid {
            Err(E_ACCESSDENIED.into())
        } else {
            validate_client(&connection, check_client_elevated)
        };
        if let Err(err) = validation {
            reject_client(server.channel(), connection, err);
            continue;
        }

        let served = connection.serve(|message| match message {
            BrokerMessage::InvokeRunAs(request) => invoke_run_as(&request),
            BrokerMessage::ExecuteRunAs { .. } => Err(E_INVALID_PARAMETER.into()),
        });
        if let Err(err) = served {
            tracing::trace_log_message(&format!("run-as client dropped: {:?}", err.code()));
        }
    }
}
