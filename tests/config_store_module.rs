use pocketclaw::app::command_handlers::run_cli;
use pocketclaw::config::{load_settings_from, ConfigError, TRANSPORT_API_BASE_ENV, WORKER_BIN_ENV};
use pocketclaw::store::{
    ConversationRole, ConversationTurn, PendingApproval, QueuedRequest, RunningTask, StateStore,
    KEY_WORKING_DIRECTORY,
};
use std::fs;
use std::sync::Mutex;
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn settings_file_is_parsed_overridden_and_validated() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        r#"
whitelist: ["+15551234567"]
operator: "whatsapp:+15551234567"
transport:
  from: "whatsapp:+15550000000"
worker:
  binary: claude
  extra_args: ["--dangerously-skip-permissions"]
"#,
    )
    .expect("write config");

    std::env::set_var(WORKER_BIN_ENV, "/opt/fake-worker");
    std::env::set_var(TRANSPORT_API_BASE_ENV, "http://127.0.0.1:9");
    let loaded = load_settings_from(&path);
    std::env::remove_var(WORKER_BIN_ENV);
    std::env::remove_var(TRANSPORT_API_BASE_ENV);

    let settings = loaded.expect("settings");
    assert_eq!(settings.worker.binary, "/opt/fake-worker");
    assert_eq!(
        settings.transport.api_base.as_deref(),
        Some("http://127.0.0.1:9")
    );
    assert_eq!(settings.operator_address(), Some("whatsapp:+15551234567"));
    assert_eq!(settings.worker.extra_args.len(), 1);
}

#[test]
fn invalid_or_missing_config_is_reported_with_its_path() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("absent.yaml");
    let err = load_settings_from(&missing).expect_err("missing");
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err.to_string().contains("absent.yaml"));

    let bad = dir.path().join("bad.yaml");
    fs::write(&bad, "whitelist: []\ntransport:\n  from: \"+1555\"\n").expect("write");
    let err = load_settings_from(&bad).expect_err("empty whitelist");
    assert!(err.to_string().contains("whitelist"));
}

#[test]
fn durable_state_survives_reopening_the_database() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("nested/state.db");
    {
        let store = StateStore::open(&db).expect("open");
        assert!(store.mark_processed("SM1", 100).expect("mark"));
        store
            .claim_running_task(&RunningTask {
                id: "task-1".to_string(),
                description: "build".to_string(),
                started_at: 5,
                worker_pid: Some(4242),
            })
            .expect("claim");
        store
            .enqueue(&QueuedRequest {
                id: "req-1".to_string(),
                source_event_id: "SM2".to_string(),
                sender: "+1".to_string(),
                body: "next".to_string(),
                enqueued_at: 6,
            })
            .expect("enqueue");
        store
            .append_turn(&ConversationTurn {
                sender: "+1".to_string(),
                role: ConversationRole::User,
                text: "build".to_string(),
                timestamp: 5,
            })
            .expect("turn");
        store
            .insert_approval(&PendingApproval {
                id: "apr-1".to_string(),
                task_id: "SM3".to_string(),
                command: "rm -rf out".to_string(),
                sender: "+1".to_string(),
                created_at: 7,
                expires_at: 1_000,
            })
            .expect("approval");
        store
            .set_value(KEY_WORKING_DIRECTORY, "/srv/app")
            .expect("cwd");
    }

    let store = StateStore::open(&db).expect("reopen");
    assert!(!store.mark_processed("SM1", 200).expect("mark again"));
    assert_eq!(
        store.running_task().expect("slot").and_then(|t| t.worker_pid),
        Some(4242)
    );
    assert_eq!(store.queue_position("SM2").expect("position"), Some(1));
    assert_eq!(store.recent_turns("+1", 5).expect("turns").len(), 1);
    assert_eq!(
        store
            .active_approval("+1", 500)
            .expect("approval")
            .map(|a| a.command),
        Some("rm -rf out".to_string())
    );
    assert_eq!(
        store.get_value(KEY_WORKING_DIRECTORY).expect("cwd"),
        Some("/srv/app".to_string())
    );
}

#[test]
fn cli_reports_help_and_rejects_unknown_commands() {
    let help = run_cli(vec!["help".to_string()]).expect("help");
    assert!(help.contains("Usage: pocketclaw"));
    assert!(help.contains("status"));

    let err = run_cli(vec!["setup".to_string()]).expect_err("unknown");
    assert!(err.contains("unknown command"));
}
