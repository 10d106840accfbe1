//! Integration tests for terminal sessions and the connection gateway
//!
//! Shells are plain /bin/sh running as the current user.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use labbox::admission::AdmissionController;
use labbox::config::types::{
    AdmissionConfig, IsolationKind, LabError, PrincipalConfig, TerminalConfig, TerminalMode,
};
use labbox::lab::definition::LabDefinition;
use labbox::principal::{Principal, PrincipalManager};
use labbox::terminal::gateway::{LAB_SESSION_NOT_FOUND, NO_ACTIVE_SESSION};
use labbox::terminal::manager::SESSION_ENDED;
use labbox::terminal::{
    ClientEvent, EventSink, Gateway, InMemoryDirectory, LabSessionRecord, SessionState, TerminalEvent,
    TerminalManager,
};
use labbox::utils::env_hygiene::EnvPolicy;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn terminal_config() -> TerminalConfig {
    TerminalConfig {
        shell: "/bin/sh".into(),
        shell_args: Vec::new(),
        poll_interval_ms: 20,
        kill_grace_ms: 100,
        ..TerminalConfig::default()
    }
}

fn principal(home: &Path) -> Principal {
    Principal::service_fallback("stu_term_00000000", home.to_path_buf(), "/bin/sh".into())
}

/// Collect events until one satisfies `done` or the deadline passes
fn wait_for<F>(rx: &Receiver<TerminalEvent>, mut done: F) -> Vec<TerminalEvent>
where
    F: FnMut(&TerminalEvent, &str) -> bool,
{
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    let mut text = String::new();
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                if let TerminalEvent::TerminalOutput { data } = &event {
                    text.push_str(data);
                }
                let finished = done(&event, &text);
                seen.push(event);
                if finished {
                    return seen;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    panic!("condition not met; events so far: {:?}", seen);
}

fn output_contains(needle: &'static str) -> impl FnMut(&TerminalEvent, &str) -> bool {
    move |_: &TerminalEvent, text: &str| text.contains(needle)
}

#[test]
fn shell_output_is_streamed() {
    let home = tempfile::tempdir().unwrap();
    let manager = TerminalManager::new(terminal_config());
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let id = manager.open(&principal(home.path()), home.path(), Arc::new(tx)).unwrap();
    manager.write_input(&id, b"echo labbox-$((40+2))\n").unwrap();
    wait_for(&rx, output_contains("labbox-42"));

    manager.resize(&id, 50, 132).unwrap();
    manager.close(&id).unwrap();
}

#[test]
fn close_twice_leaves_session_closed() {
    let home = tempfile::tempdir().unwrap();
    let manager = TerminalManager::new(terminal_config());
    let (tx, _rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let id = manager.open(&principal(home.path()), home.path(), Arc::new(tx)).unwrap();
    let session = manager.session(&id).unwrap();
    assert_eq!(session.state(), SessionState::Running);

    manager.close(&id).unwrap();
    manager.close(&id).unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.teardown("again"));
    assert_eq!(manager.live_count(), 0);
    assert!(matches!(
        manager.write_input(&id, b"ls\n"),
        Err(LabError::SessionExpired(_))
    ));
}

#[test]
fn shell_exit_tears_session_down() {
    let home = tempfile::tempdir().unwrap();
    let manager = TerminalManager::new(terminal_config());
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let id = manager.open(&principal(home.path()), home.path(), Arc::new(tx)).unwrap();
    let session = manager.session(&id).unwrap();
    manager.write_input(&id, b"exit\n").unwrap();

    wait_for(&rx, |event, _| *event == TerminalEvent::error(SESSION_ENDED));

    let deadline = Instant::now() + WAIT;
    while manager.session(&id).is_some() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(manager.session(&id).is_none());
    assert_eq!(session.state(), SessionState::Closed);
    // closing an already ended session is harmless
    manager.close(&id).unwrap();
}

#[test]
fn shell_runs_in_the_requested_directory_with_clean_env() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("marker-file"), "").unwrap();
    let manager = TerminalManager::new(terminal_config());
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let id = manager.open(&principal(home.path()), work.path(), Arc::new(tx)).unwrap();
    manager
        .write_input(&id, b"ls; echo user=$USER; echo preload=${LD_PRELOAD:-none}\n")
        .unwrap();
    let events = wait_for(&rx, output_contains("preload=none"));
    let text: String = events
        .iter()
        .filter_map(|event| match event {
            TerminalEvent::TerminalOutput { data } => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert!(text.contains("marker-file"));
    assert!(text.contains("user=stu_term_00000000"));
    manager.close(&id).unwrap();
}

struct Harness {
    _root: tempfile::TempDir,
    gateway: Gateway,
    terminals: Arc<TerminalManager>,
    folder: std::path::PathBuf,
}

fn harness(mode: TerminalMode) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let folder = root.path().join("labs").join("stu-web");
    std::fs::create_dir_all(&folder).unwrap();

    let directory = InMemoryDirectory::new();
    directory.insert(
        "42",
        LabSessionRecord {
            lab: LabDefinition::from_json(r#"{ "name": "Web Basics", "template": "web" }"#)
                .unwrap(),
            student_folder: folder.clone(),
            email: "alice@uni.edu".to_string(),
        },
    );

    let terminals = Arc::new(TerminalManager::new(terminal_config()));
    let gateway = Gateway {
        mode,
        terminals: terminals.clone(),
        admission: Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            EnvPolicy::default(),
        )),
        principals: Arc::new(PrincipalManager::from_config(&PrincipalConfig {
            isolation: IsolationKind::SharedAccount,
            home_root: root.path().join("home"),
            strict_mode: false,
            ..PrincipalConfig::default()
        })),
        directory: Arc::new(directory),
    };
    Harness {
        _root: root,
        gateway,
        terminals,
        folder,
    }
}

fn start(id: &str) -> ClientEvent {
    ClientEvent::StartTerminal {
        lab_session_id: id.to_string(),
    }
}

fn input(data: &str) -> ClientEvent {
    ClientEvent::TerminalInput {
        data: data.to_string(),
    }
}

#[test]
fn unknown_lab_session_is_reported() {
    let h = harness(TerminalMode::Fallback);
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
    let mut connection = h.gateway.connect(Arc::new(tx));

    connection.handle(start("nope")).unwrap();
    assert_eq!(rx.try_recv().unwrap(), TerminalEvent::error(LAB_SESSION_NOT_FOUND));
    assert!(!connection.has_terminal());
}

#[test]
fn input_without_terminal_is_reported() {
    let h = harness(TerminalMode::Fallback);
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
    let mut connection = h.gateway.connect(Arc::new(tx));

    connection.handle(input("ls\r")).unwrap();
    assert_eq!(rx.try_recv().unwrap(), TerminalEvent::error(NO_ACTIVE_SESSION));
}

#[test]
fn fallback_console_greets_and_runs_commands() {
    let h = harness(TerminalMode::Fallback);
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
    let mut connection = h.gateway.connect(Arc::new(tx));

    connection.handle(start("42")).unwrap();
    let greeting: Vec<_> = rx.try_iter().collect();
    assert_eq!(greeting.len(), 2);
    match &greeting[0] {
        TerminalEvent::TerminalOutput { data } => {
            assert!(data.contains("Lab Terminal - Web Basics"));
            assert!(data.ends_with("lab:stu-web$ "));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(greeting[1], TerminalEvent::ready());

    connection.handle(input("pwd\r")).unwrap();
    let text: String = rx
        .try_iter()
        .filter_map(|event| match event {
            TerminalEvent::TerminalOutput { data } => Some(data),
            _ => None,
        })
        .collect();
    assert!(text.contains(h.folder.file_name().unwrap().to_str().unwrap()));

    connection.handle(input("sudo ls\r")).unwrap();
    let text: String = rx
        .try_iter()
        .filter_map(|event| match event {
            TerminalEvent::TerminalOutput { data } => Some(data),
            _ => None,
        })
        .collect();
    assert!(text.contains("Command blocked: Command 'sudo' is not allowed"));
}

#[test]
fn pty_gateway_routes_input_and_closes_on_disconnect() {
    let h = harness(TerminalMode::Pty);
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
    let mut connection = h.gateway.connect(Arc::new(tx));

    connection.handle(start("42")).unwrap();
    wait_for(&rx, |event, _| *event == TerminalEvent::ready());
    assert_eq!(h.terminals.live_count(), 1);

    connection
        .handle(ClientEvent::TerminalResize { rows: 30, cols: 100 })
        .unwrap();
    connection.handle(input("echo gw-$((2+3))\n")).unwrap();
    wait_for(&rx, output_contains("gw-5"));

    // a second start replaces the first session
    connection.handle(start("42")).unwrap();
    wait_for(&rx, |event, _| *event == TerminalEvent::ready());
    assert_eq!(h.terminals.live_count(), 1);

    connection.handle(ClientEvent::Disconnect).unwrap();
    assert_eq!(h.terminals.live_count(), 0);
    assert!(!connection.has_terminal());
}

#[test]
fn pty_banner_precedes_shell_output() {
    let h = harness(TerminalMode::Pty);
    let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
    let mut connection = h.gateway.connect(Arc::new(tx));

    connection.handle(start("42")).unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        TerminalEvent::TerminalOutput { data } => {
            assert!(data.contains("Lab Terminal - Web Basics"), "got {:?}", data)
        }
        other => panic!("unexpected {:?}", other),
    }
    connection.handle(ClientEvent::Disconnect).unwrap();
}

#[test]
fn session_stays_listed_until_teardown_completes() {
    let home = tempfile::tempdir().unwrap();
    let manager = Arc::new(TerminalManager::new(terminal_config()));
    let (tx, _rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let watch = |id: String| {
        let manager = manager.clone();
        let session = manager.session(&id).unwrap();
        std::thread::spawn(move || {
            let deadline = Instant::now() + WAIT;
            while manager.session(&id).is_some() && Instant::now() < deadline {
                std::thread::yield_now();
            }
            session.state()
        })
    };

    let tx: Arc<dyn EventSink> = Arc::new(tx);
    let first = manager.open(&principal(home.path()), home.path(), tx.clone()).unwrap();
    let observer = watch(first.clone());
    manager.close(&first).unwrap();
    assert_eq!(observer.join().unwrap(), SessionState::Closed);

    let second = manager.open(&principal(home.path()), home.path(), tx).unwrap();
    let observer = watch(second);
    manager.close_all();
    assert_eq!(observer.join().unwrap(), SessionState::Closed);
    assert_eq!(manager.live_count(), 0);
}

#[test]
fn blocked_input_does_not_stall_close() {
    let home = tempfile::tempdir().unwrap();
    let manager = Arc::new(TerminalManager::new(terminal_config()));
    let (tx, _rx) = crossbeam_channel::unbounded::<TerminalEvent>();

    let id = manager.open(&principal(home.path()), home.path(), Arc::new(tx)).unwrap();
    // nothing reads the terminal's input from here on
    manager.write_input(&id, b"exec sleep 30\n").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    {
        let manager = manager.clone();
        let id = id.clone();
        std::thread::spawn(move || {
            let _ = manager.write_input(&id, &vec![b'x'; 1 << 20]);
        });
    }
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    manager.close(&id).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(manager.session(&id).is_none());
}
