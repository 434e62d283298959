use pocketclaw::config::Settings;
use pocketclaw::runtime::{
    load_daemon_state, run_daemon_with, LoopState, RuntimeError, StatePaths,
};
use pocketclaw::shared::time::now_millis;
use pocketclaw::store::{RunningTask, StateStore};
use pocketclaw::transport::{InboundEvent, Transport, TransportError};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const OPERATOR: &str = "+15551234567";

#[derive(Default)]
struct ScriptedTransport {
    inbound: Mutex<Vec<InboundEvent>>,
    sent: Mutex<Vec<String>>,
    panic_on_fetch: bool,
}

impl ScriptedTransport {
    fn bodies(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    fn wait_for(&self, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.bodies().iter().any(|body| body.contains(needle)) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Transport for ScriptedTransport {
    fn fetch_inbound(&self, _since_ms: i64) -> Result<Vec<InboundEvent>, TransportError> {
        if self.panic_on_fetch {
            panic!("fetch blew up");
        }
        Ok(self.inbound.lock().expect("inbound lock").clone())
    }

    fn send(
        &self,
        _to: &str,
        body: &str,
        _media_url: Option<&str>,
    ) -> Result<String, TransportError> {
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(body.to_string());
        Ok(format!("SM{}", sent.len()))
    }

    fn max_message_len(&self) -> usize {
        1600
    }
}

fn settings_for(dir: &Path) -> (Settings, StatePaths) {
    let root = dir.join("state");
    let work = dir.join("work");
    fs::create_dir_all(&work).expect("mkdir work");
    let yaml = format!(
        r#"
state_root: {root}
whitelist: ["{OPERATOR}"]
transport:
  from: "whatsapp:+15550000000"
worker:
  binary: /bin/true
workspace:
  default_directory: {work}
  scratch_directory: {scratch}
polling:
  interval_seconds: 1
  janitor_interval_seconds: 1
  shutdown_timeout_seconds: 2
"#,
        root = root.display(),
        work = work.display(),
        scratch = dir.join("scratch").display(),
    );
    let settings: Settings = serde_yaml::from_str(&yaml).expect("settings");
    (settings, StatePaths::new(&root))
}

#[test]
fn daemon_recovers_serves_commands_and_stops_on_the_stop_file() {
    let dir = tempdir().expect("tempdir");
    let (settings, paths) = settings_for(dir.path());
    fs::create_dir_all(&paths.root).expect("mkdir root");
    StateStore::open(&paths.state_db_path())
        .expect("store")
        .claim_running_task(&RunningTask {
            id: "task-old".to_string(),
            description: "half done".to_string(),
            started_at: now_millis() - 5_000,
            worker_pid: None,
        })
        .expect("seed stale task");

    let transport = Arc::new(ScriptedTransport::default());
    transport
        .inbound
        .lock()
        .expect("inbound lock")
        .push(InboundEvent {
            id: "SM1".to_string(),
            sender: OPERATOR.to_string(),
            body: "status".to_string(),
            received_at: now_millis() + 60_000,
        });

    let daemon_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
    let daemon = thread::spawn(move || run_daemon_with(settings, daemon_transport));

    assert!(transport.wait_for("Idle."), "{:?}", transport.bodies());
    let bodies = transport.bodies();
    assert!(bodies[0].starts_with("Restarted. The previous task did not finish: half done"));
    assert!(bodies[1].starts_with("pocketclaw is up. Directory: "));
    assert!(load_daemon_state(&paths).expect("state").running);

    fs::write(paths.stop_signal_path(), "stop").expect("stop file");
    daemon.join().expect("join").expect("clean exit");

    let state = load_daemon_state(&paths).expect("state");
    assert!(!state.running);
    assert_eq!(state.pid, None);
    assert!(state
        .loops
        .values()
        .all(|health| health.state == LoopState::Stopped));
    assert!(!paths.lock_path().exists());
    assert!(!paths.stop_signal_path().exists());
    assert_eq!(
        bodies.iter().filter(|body| body.contains("Idle.")).count(),
        1
    );
}

#[test]
fn panicking_poll_tick_stops_the_daemon_and_notifies_the_operator() {
    let dir = tempdir().expect("tempdir");
    let (settings, paths) = settings_for(dir.path());
    let transport = Arc::new(ScriptedTransport {
        panic_on_fetch: true,
        ..ScriptedTransport::default()
    });

    let daemon_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
    let daemon = thread::spawn(move || run_daemon_with(settings, daemon_transport));

    let deadline = Instant::now() + Duration::from_secs(15);
    while !daemon.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(daemon.is_finished(), "daemon kept running after a loop panic");
    let err = daemon.join().expect("join").expect_err("panic is an error");
    assert!(matches!(&err, RuntimeError::Panicked(message) if message == "fetch blew up"));

    let bodies = transport.bodies();
    assert!(
        bodies
            .iter()
            .any(|body| body.contains("stopped on an error") && body.contains("fetch blew up")),
        "{bodies:?}"
    );
    let state = load_daemon_state(&paths).expect("state");
    assert!(!state.running);
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("fetch blew up")));
    assert!(!paths.lock_path().exists());
}
