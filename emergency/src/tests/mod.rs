use super::*;
use crate::broker::BrokerChannel;
use crate::messages::{BrokerMessage, Credential, RunAsRequest};
use crate::pipe_client::connect_pipe;
use crate::pipe_server::{PipeSecurity, PipeServer};
use crate::security::create_security_descriptor_for_process;
use std::time::Duration;

fn parse(args: &[&str]) -> std::result::Result<ArgMatches, clap::Error> {
    emergency_cli().try_get_matches_from(std::iter::once("emergency").chain(args.iter().copied()))
}

#[test]
fn test_cli_modes() {
    let m = parse(&[]).unwrap();
    assert!(!m.get_flag("broker") && !m.get_flag("new-instance"));
    assert!(m.subcommand().is_none());

    let m = parse(&["--broker", "--parent", "4242"]).unwrap();
    assert!(m.get_flag("broker"));
    assert_eq!(m.get_one::<u32>("parent"), Some(&4242));

    let m = parse(&[
        "--runas-service",
        "EmergencyDeskAbCdEfGh12345678",
        "--parent",
        "7",
    ])
    .unwrap();
    assert_eq!(
        m.get_one::<String>("runas-service").map(String::as_str),
        Some("EmergencyDeskAbCdEfGh12345678")
    );

    let m = parse(&["--switch", "WinSTA0\\Emergency", "--new-instance"]).unwrap();
    assert_eq!(
        m.get_one::<String>("switch").map(String::as_str),
        Some("WinSTA0\\Emergency")
    );
    assert!(m.get_flag("new-instance"));
}

#[test]
fn test_cli_rejects_bad_combinations() {
    // Server modes need to know who they serve.
    assert!(parse(&["--broker"]).is_err());
    assert!(parse(&["--runas-service", "x"]).is_err());
    assert!(parse(&["--broker", "--parent", "not-a-pid"]).is_err());
    // One mode at a time.
    assert!(parse(&["--broker", "--switch", "Emergency", "--parent", "1"]).is_err());
    // Subcommands don't mix with modes.
    assert!(parse(&["--switch", "Emergency", "desktops"]).is_err());
}

#[test]
fn test_cli_subcommands() {
    let m = parse(&["desktop"]).unwrap();
    match m.subcommand() {
        Some(("desktop", sub)) => assert!(sub.get_one::<String>("value").is_none()),
        other => panic!("{other:?}"),
    }

    let m = parse(&["desktop", "WinSTA0\\Other"]).unwrap();
    match m.subcommand() {
        Some(("desktop", sub)) => assert_eq!(
            sub.get_one::<String>("value").map(String::as_str),
            Some("WinSTA0\\Other")
        ),
        other => panic!("{other:?}"),
    }

    assert_eq!(parse(&["desktops"]).unwrap().subcommand_name(), Some("desktops"));
}

fn sample_request() -> RunAsRequest {
    RunAsRequest {
        target_executable: r"C:\Windows\System32\cmd.exe".to_owned(),
        command_line: "cmd.exe /c exit".to_owned(),
        current_directory: Some(r"C:\Windows".to_owned()),
        credential: Credential::ProcessToken { process_id: 4 },
        session_id: 1,
        desktop_name: "WinSTA0\\Emergency".to_owned(),
        use_linked_token: true,
    }
}

/// A real pipe, served on another thread, locked to our own user.
#[test]
fn test_pipe_round_trip() {
    let channel = format!("EmergencyDeskTest{}", random_alphanumeric(RANDOM_SUFFIX_LEN));
    let (ready_tx, ready_rx) = mpsc::channel();
    let (seen_tx, seen_rx) = mpsc::channel();

    let server_channel = channel.clone();
    let server = std::thread::spawn(move || -> Result<()> {
        let security = create_security_descriptor_for_process(std::process::id())?;
        let mut server =
            PipeServer::listen(&server_channel, PipeSecurity::Descriptor(security))?;
        ready_tx.send(()).unwrap();

        let mut connection = server.accept()?;
        assert_eq!(connection.client_pid(), std::process::id());
        check_client_same_user(*connection.open_client()?)?;

        let mut first = true;
        connection.serve(|message| {
            seen_tx.send(message).unwrap();
            if std::mem::take(&mut first) {
                Ok(())
            } else {
                Err(E_ACCESSDENIED.into())
            }
        })
    });

    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut client = connect_pipe(&channel).unwrap();

    let invoke = BrokerMessage::InvokeRunAs(sample_request());
    assert_eq!(client.call(&invoke), Ok(()));
    let execute = BrokerMessage::ExecuteRunAs {
        service_name: "EmergencyDeskAbCdEfGh12345678".to_owned(),
        request: sample_request(),
    };
    // The server's error comes back verbatim.
    assert_eq!(client.call(&execute), Err(E_ACCESSDENIED.into()));

    // Hanging up ends the server's loop cleanly.
    drop(client);
    server.join().unwrap().unwrap();

    assert_eq!(seen_rx.try_iter().collect::<Vec<_>>(), vec![invoke, execute]);
}

#[test]
fn test_first_instance_is_exclusive() {
    let channel = format!("EmergencyDeskTest{}", random_alphanumeric(RANDOM_SUFFIX_LEN));
    let security = create_security_descriptor_for_process(std::process::id()).unwrap();
    let _first = PipeServer::listen(&channel, PipeSecurity::Descriptor(security)).unwrap();

    let security = create_security_descriptor_for_process(std::process::id()).unwrap();
    assert!(PipeServer::listen(&channel, PipeSecurity::Descriptor(security)).is_err());
}
