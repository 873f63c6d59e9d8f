use super::*;
use crate::config::{LogConfig, ModelVariant, ServiceDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;

fn log_store(dir: &TempDir) -> Arc<LogStore> {
    Arc::new(LogStore::new(&LogConfig {
        dir: dir.path().join("logs"),
        ..LogConfig::default()
    }))
}

fn spec(dir: &TempDir, args: &[&str]) -> CommandSpec {
    CommandSpec {
        program_and_args: args.iter().map(|s| s.to_string()).collect(),
        working_dir: dir.path().to_path_buf(),
        environment: std::env::vars().collect(),
        port: None,
    }
}

#[test]
fn test_render_substitutes_model_placeholders() {
    let mut def = ServiceDefinition::new(vec![
        "vllm".to_string(),
        "serve".to_string(),
        "{{ model }}".to_string(),
    ]);
    def.id = "vllm".to_string();
    def.working_dir = Some(PathBuf::from("/tmp"));
    def.environment
        .insert("SHORT".to_string(), "{{ model_short }}".to_string());

    let vars = ModelVariant::new("org/large").template_vars();
    let spec = CommandSpec::render(&def, &vars).unwrap();

    assert_eq!(spec.program_and_args, vec!["vllm", "serve", "org/large"]);
    assert_eq!(spec.environment.get("SHORT").map(String::as_str), Some("large"));
    assert_eq!(spec.program(), Some("vllm"));
}

#[test]
fn test_render_missing_placeholder_is_template_error() {
    let mut def = ServiceDefinition::new(vec!["x".to_string(), "{{ model }}".to_string()]);
    def.id = "svc".to_string();
    let err = CommandSpec::render(&def, &HashMap::new()).unwrap_err();
    assert!(matches!(err, DaemonError::Template { ref service, .. } if service == "svc"));
}

#[tokio::test]
async fn test_terminate_graceful() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    let handle = spawn_service("sleeper", 1, &spec(&dir, &["sleep", "30"]), log_store(&dir), tx).unwrap();

    assert!(!handle.has_exited());
    assert!(process_exists(handle.pid()));

    let exit = terminate("sleeper", &handle, Duration::from_secs(5)).await.unwrap();
    assert_eq!(exit.signal, Some(15));
    assert!(handle.has_exited());

    // The watcher still reports the exit, tagged with the spawn generation
    let event = rx.recv().await.unwrap();
    assert_eq!(event.service, "sleeper");
    assert_eq!(event.generation, 1);
    assert_eq!(event.pid, handle.pid());
}

#[tokio::test]
async fn test_terminate_escalates_to_sigkill() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel(4);
    let handle = spawn_service(
        "stubborn",
        1,
        &spec(&dir, &["sh", "-c", "trap '' TERM; while true; do sleep 0.1; done"]),
        log_store(&dir),
        tx,
    )
    .unwrap();

    // Give the shell time to install the trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    let exit = terminate("stubborn", &handle, Duration::from_millis(300)).await.unwrap();
    assert_eq!(exit.signal, Some(9));
}

#[tokio::test]
async fn test_terminate_already_exited() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    let handle = spawn_service("quick", 7, &spec(&dir, &["sh", "-c", "exit 3"]), log_store(&dir), tx).unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.generation, 7);
    assert_eq!(event.exit.code, Some(3));
    assert_eq!(event.exit.describe(), "exit code 3");

    let exit = terminate("quick", &handle, Duration::from_secs(1)).await.unwrap();
    assert_eq!(exit.code, Some(3));
}

#[tokio::test]
async fn test_output_captured_to_log() {
    let dir = TempDir::new().unwrap();
    let logs = log_store(&dir);
    let (tx, mut rx) = mpsc::channel(4);
    spawn_service(
        "talker",
        1,
        &spec(&dir, &["sh", "-c", "echo to-stdout; echo to-stderr >&2"]),
        logs.clone(),
        tx,
    )
    .unwrap();

    rx.recv().await.unwrap();

    let lines: Vec<String> = logs.tail("talker", 10, false).into_iter().map(|l| l.line).collect();
    assert!(lines.contains(&"to-stdout".to_string()), "lines: {:?}", lines);
    assert!(lines.contains(&"to-stderr".to_string()), "lines: {:?}", lines);
}

#[tokio::test]
async fn test_invalid_utf8_output_keeps_process_alive() {
    let dir = TempDir::new().unwrap();
    let logs = log_store(&dir);
    let (tx, mut rx) = mpsc::channel(4);
    // Well past a pipe buffer of output after the bad byte
    let script = "printf 'bad\\377\\n'; echo after-bad; \
        i=0; while [ $i -lt 5000 ]; do echo \"filler line $i\"; i=$((i+1)); done; \
        echo done-writing";
    spawn_service("binary", 1, &spec(&dir, &["sh", "-c", script]), logs.clone(), tx).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.exit.code, Some(0), "exit: {}", event.exit.describe());

    let lines: Vec<String> = logs.tail("binary", 6000, false).into_iter().map(|l| l.line).collect();
    assert!(lines.contains(&"bad\u{FFFD}".to_string()), "first lines: {:?}", &lines[..lines.len().min(3)]);
    assert!(lines.contains(&"after-bad".to_string()));
    assert!(lines.contains(&"filler line 4999".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("done-writing"));
}

#[tokio::test]
async fn test_environment_passed_through() {
    let dir = TempDir::new().unwrap();
    let logs = log_store(&dir);
    let (tx, mut rx) = mpsc::channel(4);
    let mut spec = spec(&dir, &["sh", "-c", "echo \"value=$COCKPIT_PROC_TEST\""]);
    spec.environment
        .insert("COCKPIT_PROC_TEST".to_string(), "42".to_string());

    spawn_service("env", 1, &spec, logs.clone(), tx).unwrap();
    rx.recv().await.unwrap();

    let lines = logs.tail("env", 10, false);
    assert_eq!(lines.last().map(|l| l.line.as_str()), Some("value=42"));
}

#[tokio::test]
async fn test_missing_working_dir() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel(4);
    let mut spec = spec(&dir, &["sleep", "1"]);
    spec.working_dir = dir.path().join("does-not-exist");

    let err = spawn_service("svc", 1, &spec, log_store(&dir), tx).unwrap_err();
    assert!(matches!(err, DaemonError::WorkingDirMissing { .. }));
}

#[tokio::test]
async fn test_missing_binary() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel(4);
    let spec = spec(&dir, &["/nonexistent/cockpit-binary"]);

    let err = spawn_service("svc", 1, &spec, log_store(&dir), tx).unwrap_err();
    assert!(matches!(err, DaemonError::ProcessSpawn { .. }));
}

#[tokio::test]
async fn test_port_already_bound() {
    let dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    assert!(port_in_use(port));

    let (tx, _rx) = mpsc::channel(4);
    let mut spec = spec(&dir, &["sleep", "1"]);
    spec.port = Some(port);

    let err = spawn_service("svc", 1, &spec, log_store(&dir), tx).unwrap_err();
    assert!(matches!(err, DaemonError::PortInUse { port: p, .. } if p == port));
}

#[tokio::test]
async fn test_validate_and_kill_orphan() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel(4);
    let handle = spawn_service("orphan", 1, &spec(&dir, &["sleep", "30"]), log_store(&dir), tx).unwrap();

    let start_time = handle.os_start_time();
    assert!(start_time.is_some());
    assert!(validate_running_process(handle.pid(), start_time));
    // Start time mismatch looks like PID reuse
    assert!(!validate_running_process(handle.pid(), start_time.map(|t| t - 3600)));

    assert!(kill_process_by_pid(handle.pid(), Duration::from_secs(2)).await);
    assert!(handle.wait_exit(Duration::from_secs(2)).await.is_some());
    assert!(!validate_running_process(handle.pid(), start_time));
}
