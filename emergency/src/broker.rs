use crate::helpers::{
    random_alphanumeric, E_BROKEN_PIPE, E_FILENOTFOUND, E_PIPE_BUSY, E_TIMEOUT, RANDOM_SUFFIX_LEN,
};
use crate::messages::{BrokerMessage, RunAsRequest};
use crate::tracing;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use windows::{core::*, Win32::Foundation::*};

/// Run-as services are registered as this prefix plus a random suffix.
pub const SERVICE_NAME_PREFIX: &str = "EmergencyDesk";

/// The elevated broker listens here. The name is fixed so that several
/// unelevated callers in one session can share a single UAC prompt; the
/// broker only lets in clients running as the user who started it.
pub const ELEVATION_CHANNEL: &str = "EmergencyDeskBroker";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RetryPolicy {
    /// Connection attempts in total. Zero is treated as one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    /// Ten tries, 100ms apart: about a second for a freshly started service
    /// or broker to get its first pipe instance up.
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// A connected channel to either the elevated broker or a run-as service.
/// Dropping it disconnects.
pub trait BrokerChannel: Send {
    /// Sends one message and waits for its result.
    fn call(&mut self, message: &BrokerMessage) -> Result<()>;
}

/// Everything the client side needs from the OS.
pub trait BrokerPlatform: Send + Sync {
    type Channel: BrokerChannel;

    fn is_elevated(&self) -> Result<bool>;

    /// A single connection attempt. Errors for which `is_not_listening` is
    /// true mean nobody is serving `channel` (yet).
    fn connect(&self, channel: &str) -> Result<Self::Channel>;

    /// Starts an elevated copy of ourselves serving `ELEVATION_CHANNEL`.
    /// Shows the UAC prompt; a declined prompt is `E_CANCELLED`.
    fn launch_elevated_broker(&self) -> Result<()>;

    /// Opens the request's window station and desktop up to SYSTEM. A
    /// process started there can't draw otherwise. Must be called elevated.
    fn harden_desktop(&self, desktop_name: &str) -> Result<()>;

    /// Registers `service_name` as a transient LocalSystem service, starts it
    /// and marks it for deletion. Must be called elevated.
    fn start_runas_service(&self, service_name: &str, request: &RunAsRequest) -> Result<()>;

    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay)
    }
}

pub fn generate_service_name() -> String {
    format!(
        "{SERVICE_NAME_PREFIX}{}",
        random_alphanumeric(RANDOM_SUFFIX_LEN)
    )
}

pub fn is_not_listening(err: &Error) -> bool {
    err.code() == E_FILENOTFOUND || err.code() == E_PIPE_BUSY
}

/// The server went away mid-call, so whatever it did with the message, we
/// never heard back.
pub fn is_hung_up(err: &Error) -> bool {
    err.code() == E_BROKEN_PIPE
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connects to `channel`, retrying while the server isn't listening yet.
/// Sleeps only between attempts. Any other error ends the loop right away;
/// running out of attempts is `ERROR_TIMEOUT`.
pub fn connect_with_retry<P: BrokerPlatform>(
    platform: &P,
    channel: &str,
    policy: RetryPolicy,
) -> Result<P::Channel> {
    let max_attempts = policy.attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match platform.connect(channel) {
            Ok(connection) => {
                tracing::trace_connect(channel, attempts, S_OK);
                return Ok(connection);
            }
            Err(err) if is_not_listening(&err) && attempts < max_attempts => {
                platform.sleep(policy.delay);
            }
            Err(err) if is_not_listening(&err) => {
                tracing::trace_connect(channel, attempts, E_TIMEOUT);
                return Err(E_TIMEOUT.into());
            }
            Err(err) => {
                tracing::trace_connect(channel, attempts, err.code());
                return Err(err);
            }
        }
    }
}

struct ElevationSlot<C> {
    reference_count: usize,
    channel: Option<Arc<Mutex<C>>>,
}

/// The shared connection to the elevated broker. The first `acquire` brings
/// it up (prompting for elevation if needed); the last `BrokerLease` to go
/// away tears it down, which in turn lets the broker exit.
pub struct ElevationConnection<C> {
    slot: Mutex<ElevationSlot<C>>,
}

impl<C> Default for ElevationConnection<C> {
    fn default() -> Self {
        ElevationConnection {
            slot: Mutex::new(ElevationSlot {
                reference_count: 0,
                channel: None,
            }),
        }
    }
}

impl<C: BrokerChannel> ElevationConnection<C> {
    /// A failed acquire leaves the count untouched.
    pub fn acquire<P>(&self, platform: &P, policy: RetryPolicy) -> Result<BrokerLease<'_, C>>
    where
        P: BrokerPlatform<Channel = C>,
    {
        let mut slot = lock(&self.slot);
        if let Some(channel) = &slot.channel {
            let channel = channel.clone();
            slot.reference_count += 1;
            return Ok(BrokerLease {
                connection: self,
                channel,
            });
        }

        // Somebody else in this session may have a broker up already.
        let channel = match platform.connect(ELEVATION_CHANNEL) {
            Ok(channel) => channel,
            Err(err) if is_not_listening(&err) => {
                platform.launch_elevated_broker()?;
                connect_with_retry(platform, ELEVATION_CHANNEL, policy)?
            }
            Err(err) => return Err(err),
        };

        let channel = Arc::new(Mutex::new(channel));
        slot.channel = Some(channel.clone());
        slot.reference_count = 1;
        Ok(BrokerLease {
            connection: self,
            channel,
        })
    }

    #[cfg(test)]
    pub fn reference_count(&self) -> usize {
        lock(&self.slot).reference_count
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        lock(&self.slot).channel.is_some()
    }

    fn release(&self) {
        let mut slot = lock(&self.slot);
        debug_assert!(slot.reference_count > 0);
        slot.reference_count = slot.reference_count.saturating_sub(1);
        if slot.reference_count == 0 {
            slot.channel = None;
        }
    }
}

pub struct BrokerLease<'a, C: BrokerChannel> {
    connection: &'a ElevationConnection<C>,
    channel: Arc<Mutex<C>>,
}

impl<C: BrokerChannel> BrokerLease<'_, C> {
    pub fn call(&self, message: &BrokerMessage) -> Result<()> {
        lock(&self.channel).call(message)
    }
}

impl<C: BrokerChannel> Drop for BrokerLease<'_, C> {
    fn drop(&mut self) {
        self.connection.release();
    }
}

/// Gets a `RunAsRequest` executed by a LocalSystem run-as service, elevating
/// through the broker when we aren't elevated ourselves.
pub struct BrokerClient<P: BrokerPlatform> {
    platform: P,
    policy: RetryPolicy,
    runas_service: Mutex<Option<String>>,
    elevation: ElevationConnection<P::Channel>,
}

impl<P: BrokerPlatform> BrokerClient<P> {
    pub fn new(platform: P, policy: RetryPolicy) -> Self {
        BrokerClient {
            platform,
            policy,
            runas_service: Mutex::new(None),
            elevation: ElevationConnection::default(),
        }
    }

    #[cfg(test)]
    pub fn elevation(&self) -> &ElevationConnection<P::Channel> {
        &self.elevation
    }

    #[cfg(test)]
    pub fn cached_service_name(&self) -> Option<String> {
        lock(&self.runas_service).clone()
    }

    pub fn execute(&self, request: &RunAsRequest) -> Result<()> {
        request.validate()?;

        if let Some(result) = self.try_cached_service(request) {
            return result;
        }

        let service_name = generate_service_name();
        *lock(&self.runas_service) = Some(service_name.clone());

        let result = if self.platform.is_elevated()? {
            self.execute_in_process(&service_name, request)
        } else {
            self.execute_via_broker(&service_name, request)
        };

        tracing::trace_run_as(
            true,
            &request.target_executable,
            request.session_id,
            &request.desktop_name,
            result.as_ref().err().map(Error::code).unwrap_or(S_OK),
        );
        result
    }

    /// A service from an earlier call may still be around (it lingers until
    /// its idle timeout). One attempt only; if it's gone, or it hangs up on
    /// us because it timed out right as we connected, the caller starts over
    /// with a fresh name.
    fn try_cached_service(&self, request: &RunAsRequest) -> Option<Result<()>> {
        let cached = lock(&self.runas_service);
        let service_name = cached.as_deref()?;
        match self.platform.connect(service_name) {
            Ok(mut channel) => match channel.call(&BrokerMessage::InvokeRunAs(request.clone())) {
                Err(err) if is_hung_up(&err) => None,
                result => Some(result),
            },
            Err(_) => None,
        }
    }

    /// The elevated path: bring up the service ourselves and hand it the
    /// request. The broker process runs this on behalf of its clients.
    pub fn execute_in_process(&self, service_name: &str, request: &RunAsRequest) -> Result<()> {
        self.platform.harden_desktop(&request.desktop_name)?;
        self.platform.start_runas_service(service_name, request)?;
        let mut channel = connect_with_retry(&self.platform, service_name, self.policy)?;
        channel.call(&BrokerMessage::InvokeRunAs(request.clone()))
    }

    fn execute_via_broker(&self, service_name: &str, request: &RunAsRequest) -> Result<()> {
        let lease = self.elevation.acquire(&self.platform, self.policy)?;
        lease.call(&BrokerMessage::ExecuteRunAs {
            service_name: service_name.to_owned(),
            request: request.clone(),
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::helpers::E_CANCELLED;
    use crate::messages::Credential;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the fake OS does when somebody connects to a channel.
    #[derive(Default)]
    pub struct FakeOs {
        /// Channels with a server behind them.
        pub listening: Vec<String>,
        /// Errors to hand out, in order, before a channel starts answering.
        pub connect_errors: HashMap<String, VecDeque<HRESULT>>,
        pub connects: Vec<String>,
        pub sleeps: Vec<Duration>,
        pub elevated: bool,
        pub uac: Option<HRESULT>,
        pub broker_launches: usize,
        pub hardened: Vec<String>,
        pub harden_error: Option<HRESULT>,
        pub services_started: Vec<String>,
        pub service_start_error: Option<HRESULT>,
        pub calls: Vec<BrokerMessage>,
        pub call_result: Option<HRESULT>,
        /// Servers that accept a connection and then die before answering.
        pub hang_up: Vec<String>,
        pub disconnects: usize,
    }

    #[derive(Clone, Default)]
    pub struct FakePlatform {
        pub os: Arc<Mutex<FakeOs>>,
        pub live_channels: Arc<AtomicUsize>,
    }

    pub struct FakeChannel {
        name: String,
        os: Arc<Mutex<FakeOs>>,
        live: Arc<AtomicUsize>,
    }

    impl BrokerChannel for FakeChannel {
        fn call(&mut self, message: &BrokerMessage) -> Result<()> {
            let mut os = self.os.lock().unwrap();
            if os.hang_up.contains(&self.name) {
                return Err(E_BROKEN_PIPE.into());
            }
            os.calls.push(message.clone());
            match os.call_result {
                Some(hr) => Err(hr.into()),
                None => Ok(()),
            }
        }
    }

    impl Drop for FakeChannel {
        fn drop(&mut self) {
            self.os.lock().unwrap().disconnects += 1;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl BrokerPlatform for FakePlatform {
        type Channel = FakeChannel;

        fn is_elevated(&self) -> Result<bool> {
            Ok(self.os.lock().unwrap().elevated)
        }

        fn connect(&self, channel: &str) -> Result<FakeChannel> {
            let mut os = self.os.lock().unwrap();
            os.connects.push(channel.to_owned());
            if let Some(hr) = os
                .connect_errors
                .get_mut(channel)
                .and_then(VecDeque::pop_front)
            {
                return Err(hr.into());
            }
            if !os.listening.iter().any(|c| c == channel) {
                return Err(E_FILENOTFOUND.into());
            }
            self.live_channels.fetch_add(1, Ordering::SeqCst);
            Ok(FakeChannel {
                name: channel.to_owned(),
                os: self.os.clone(),
                live: self.live_channels.clone(),
            })
        }

        fn launch_elevated_broker(&self) -> Result<()> {
            let mut os = self.os.lock().unwrap();
            os.broker_launches += 1;
            if let Some(hr) = os.uac {
                return Err(hr.into());
            }
            os.listening.push(ELEVATION_CHANNEL.to_owned());
            Ok(())
        }

        fn harden_desktop(&self, desktop_name: &str) -> Result<()> {
            let mut os = self.os.lock().unwrap();
            if let Some(hr) = os.harden_error {
                return Err(hr.into());
            }
            os.hardened.push(desktop_name.to_owned());
            Ok(())
        }

        fn start_runas_service(&self, service_name: &str, _: &RunAsRequest) -> Result<()> {
            let mut os = self.os.lock().unwrap();
            if let Some(hr) = os.service_start_error {
                return Err(hr.into());
            }
            os.services_started.push(service_name.to_owned());
            os.listening.push(service_name.to_owned());
            Ok(())
        }

        fn sleep(&self, delay: Duration) {
            self.os.lock().unwrap().sleeps.push(delay);
        }
    }

    impl FakePlatform {
        pub fn with(configure: impl FnOnce(&mut FakeOs)) -> Self {
            let platform = FakePlatform::default();
            configure(&mut platform.os.lock().unwrap());
            platform
        }

        pub fn os(&self) -> MutexGuard<'_, FakeOs> {
            self.os.lock().unwrap()
        }
    }

    pub fn system_request() -> RunAsRequest {
        RunAsRequest {
            target_executable: r"C:\Tools\emergency.exe".to_owned(),
            command_line: r#""C:\Tools\emergency.exe" --switch Emergency --new-instance"#
                .to_owned(),
            current_directory: None,
            credential: Credential::local_system(),
            session_id: 1,
            desktop_name: "WinSTA0\\Emergency".to_owned(),
            use_linked_token: false,
        }
    }

    #[test]
    fn test_service_names() {
        let name = generate_service_name();
        assert_eq!(name.len(), SERVICE_NAME_PREFIX.len() + RANDOM_SUFFIX_LEN);
        assert!(name.starts_with(SERVICE_NAME_PREFIX));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(name, generate_service_name());
    }

    #[test]
    fn test_retry_gives_up_after_exactly_n_attempts() {
        let platform = FakePlatform::default();
        let policy = RetryPolicy::default();
        let result = connect_with_retry(&platform, "nobody", policy);
        assert_eq!(result.err().map(|e| e.code()), Some(E_TIMEOUT));

        let os = platform.os();
        assert_eq!(os.connects.len(), 10);
        // No sleep after the last attempt.
        assert_eq!(os.sleeps, vec![Duration::from_millis(100); 9]);
    }

    #[test]
    fn test_retry_policy_without_attempts_still_tries_once() {
        let policy = RetryPolicy {
            attempts: 0,
            ..RetryPolicy::default()
        };

        let platform = FakePlatform::default();
        let result = connect_with_retry(&platform, "nobody", policy);
        assert_eq!(result.err().map(|e| e.code()), Some(E_TIMEOUT));
        assert_eq!(platform.os().connects.len(), 1);
        assert!(platform.os().sleeps.is_empty());

        let platform = FakePlatform::with(|os| os.listening.push("svc".to_owned()));
        assert!(connect_with_retry(&platform, "svc", policy).is_ok());
    }

    #[test]
    fn test_retry_until_listening() {
        let platform = FakePlatform::with(|os| {
            os.listening.push("svc".to_owned());
            os.connect_errors.insert(
                "svc".to_owned(),
                VecDeque::from([E_FILENOTFOUND, E_PIPE_BUSY, E_FILENOTFOUND]),
            );
        });
        assert!(connect_with_retry(&platform, "svc", RetryPolicy::default()).is_ok());
        assert_eq!(platform.os().connects.len(), 4);
        assert_eq!(platform.os().sleeps.len(), 3);
    }

    #[test]
    fn test_retry_stops_on_other_errors() {
        let platform = FakePlatform::with(|os| {
            os.connect_errors
                .insert("svc".to_owned(), VecDeque::from([E_ACCESSDENIED]));
        });
        let result = connect_with_retry(&platform, "svc", RetryPolicy::default());
        assert_eq!(result.err().map(|e| e.code()), Some(E_ACCESSDENIED));
        assert_eq!(platform.os().connects.len(), 1);
        assert!(platform.os().sleeps.is_empty());
    }

    #[test]
    fn test_elevation_connection_is_shared_and_torn_down_once() {
        let platform = FakePlatform::default();
        let connection = ElevationConnection::default();
        let policy = RetryPolicy::default();

        let first = connection.acquire(&platform, policy).unwrap();
        let second = connection.acquire(&platform, policy).unwrap();
        assert_eq!(connection.reference_count(), 2);
        assert_eq!(platform.os().broker_launches, 1);
        assert_eq!(platform.live_channels.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(connection.reference_count(), 1);
        assert!(connection.is_connected());
        assert_eq!(platform.os().disconnects, 0);

        drop(second);
        assert_eq!(connection.reference_count(), 0);
        assert!(!connection.is_connected());
        assert_eq!(platform.os().disconnects, 1);
        assert_eq!(platform.live_channels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_elevation_reuses_a_running_broker() {
        let platform = FakePlatform::with(|os| os.listening.push(ELEVATION_CHANNEL.to_owned()));
        let connection = ElevationConnection::default();
        let lease = connection
            .acquire(&platform, RetryPolicy::default())
            .unwrap();
        assert_eq!(platform.os().broker_launches, 0);
        drop(lease);
    }

    #[test]
    fn test_declined_uac_does_not_take_a_reference() {
        let platform = FakePlatform::with(|os| os.uac = Some(E_CANCELLED));
        let connection = ElevationConnection::default();
        let result = connection.acquire(&platform, RetryPolicy::default());
        assert_eq!(result.err().map(|e| e.code()), Some(E_CANCELLED));
        assert_eq!(connection.reference_count(), 0);
        assert!(!connection.is_connected());
        // We never got as far as retrying.
        assert!(platform.os().sleeps.is_empty());
    }

    #[test]
    fn test_execute_unelevated_goes_through_the_broker() {
        let platform = FakePlatform::default();
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());

        client.execute(&system_request()).unwrap();

        let service_name = client.cached_service_name().unwrap();
        assert!(service_name.starts_with(SERVICE_NAME_PREFIX));
        let os = platform.os();
        assert_eq!(os.broker_launches, 1);
        assert_eq!(
            os.calls,
            vec![BrokerMessage::ExecuteRunAs {
                service_name,
                request: system_request()
            }]
        );
        drop(os);
        // The lease is gone, and with it the broker connection.
        assert_eq!(client.elevation().reference_count(), 0);
        assert_eq!(platform.live_channels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_execute_elevated_starts_the_service_itself() {
        let platform = FakePlatform::with(|os| os.elevated = true);
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());

        client.execute(&system_request()).unwrap();

        let os = platform.os();
        assert_eq!(os.broker_launches, 0);
        assert_eq!(os.hardened, ["WinSTA0\\Emergency"]);
        assert_eq!(os.services_started, vec![client.cached_service_name().unwrap()]);
        assert_eq!(os.calls, vec![BrokerMessage::InvokeRunAs(system_request())]);
    }

    #[test]
    fn test_hardening_failure_stops_the_launch() {
        let platform = FakePlatform::with(|os| {
            os.elevated = true;
            os.harden_error = Some(E_ACCESSDENIED);
        });
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());

        assert_eq!(
            client.execute(&system_request()),
            Err(E_ACCESSDENIED.into())
        );
        let os = platform.os();
        assert!(os.services_started.is_empty());
        assert!(os.connects.is_empty());
        assert!(os.calls.is_empty());
    }

    #[test]
    fn test_execute_reuses_a_live_cached_service() {
        let platform = FakePlatform::with(|os| os.elevated = true);
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        client.execute(&system_request()).unwrap();
        let name = client.cached_service_name().unwrap();

        client.execute(&system_request()).unwrap();
        assert_eq!(client.cached_service_name(), Some(name));
        let os = platform.os();
        assert_eq!(os.services_started.len(), 1);
        assert_eq!(os.calls.len(), 2);
    }

    #[test]
    fn test_execute_replaces_a_stale_cached_service() {
        let platform = FakePlatform::with(|os| os.elevated = true);
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        client.execute(&system_request()).unwrap();
        let stale = client.cached_service_name().unwrap();

        // The service timed out and went away.
        platform.os().listening.clear();
        client.execute(&system_request()).unwrap();

        let fresh = client.cached_service_name().unwrap();
        assert_ne!(fresh, stale);
        assert_eq!(platform.os().services_started, vec![stale, fresh]);
    }

    #[test]
    fn test_execute_replaces_a_cached_service_that_hangs_up() {
        let platform = FakePlatform::with(|os| os.elevated = true);
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        client.execute(&system_request()).unwrap();
        let dying = client.cached_service_name().unwrap();

        // Still listening, but idles out as soon as we connect.
        platform.os().hang_up.push(dying.clone());
        client.execute(&system_request()).unwrap();

        let fresh = client.cached_service_name().unwrap();
        assert_ne!(fresh, dying);
        let os = platform.os();
        assert_eq!(os.services_started, vec![dying, fresh]);
        assert_eq!(os.calls.len(), 2);
    }

    #[test]
    fn test_execute_declined_uac_is_cancelled() {
        let platform = FakePlatform::with(|os| os.uac = Some(E_CANCELLED));
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        let result = client.execute(&system_request());
        assert_eq!(result.err().map(|e| e.code()), Some(E_CANCELLED));
        assert!(platform.os().calls.is_empty());
        assert_eq!(client.elevation().reference_count(), 0);
    }

    #[test]
    fn test_execute_service_never_comes_up() {
        let platform = FakePlatform::with(|os| {
            os.elevated = true;
            // Registered and started, but the pipe never appears.
            os.connect_errors.insert(
                "never".to_owned(),
                VecDeque::from([E_FILENOTFOUND; 10]),
            );
        });
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        let result = client.execute_in_process("never", &system_request());
        assert_eq!(result.err().map(|e| e.code()), Some(E_TIMEOUT));
        assert_eq!(platform.os().sleeps.len(), 9);
    }

    #[test]
    fn test_execute_passes_the_remote_error_through() {
        let platform = FakePlatform::with(|os| {
            os.elevated = true;
            os.call_result = Some(E_ACCESSDENIED);
        });
        let client = BrokerClient::new(platform, RetryPolicy::default());
        assert_eq!(
            client.execute(&system_request()),
            Err(E_ACCESSDENIED.into())
        );
    }

    #[test]
    fn test_execute_rejects_invalid_requests_up_front() {
        let platform = FakePlatform::default();
        let client = BrokerClient::new(platform.clone(), RetryPolicy::default());
        let mut request = system_request();
        request.target_executable.clear();
        assert!(client.execute(&request).is_err());
        assert!(platform.os().connects.is_empty());
        assert_eq!(client.cached_service_name(), None);
    }
}
