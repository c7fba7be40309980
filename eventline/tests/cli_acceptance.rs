use eventline_core::{BatchStatus, Database};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    /// Batched mode against a port nothing listens on
    fn with_unreachable_collector(batch_size: usize) -> Self {
        let env = Self::new();
        env.write_config(&format!(
            r#"
[pipeline]
api_endpoint = "http://127.0.0.1:9/v1/batches"
batch_size = {batch_size}
max_retries = 2
timeout_secs = 2
"#
        ));
        env
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("eventline");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("eventline/events.db")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(assert_cmd::cargo::cargo_bin!("eventline"));
        command
            .args(args)
            .env("HOME", &self.home)
            .env("XDG_DATA_HOME", &self.xdg_data)
            .env("XDG_CONFIG_HOME", &self.xdg_config)
            .env("XDG_STATE_HOME", &self.xdg_state)
            .env_remove("RUST_LOG");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args)
            .output()
            .unwrap_or_else(|e| panic!("failed to execute eventline: {e}"))
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &str) -> Output {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to spawn eventline");
        child
            .stdin
            .take()
            .expect("stdin should be piped")
            .write_all(stdin.as_bytes())
            .expect("failed to write stdin");
        child.wait_with_output().expect("failed to wait for eventline")
    }
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "eventline {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn events_json(n: usize) -> String {
    let events: Vec<_> = (0..n)
        .map(|i| {
            serde_json::json!({
                "eventType": "ad_impression",
                "eventCategory": "impression",
                "context": {"sessionId": "cli-session", "timestamp": 1_700_000_000_000_i64 + i as i64},
                "metadata": {"ad_id": format!("ad-{i}"), "email": "someone@example.com"}
            })
        })
        .collect();
    serde_json::Value::Array(events).to_string()
}

#[test]
fn status_reports_immediate_mode_by_default() {
    let env = CliTestEnv::new();

    let output = env.run(&["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Event Pipeline Configuration"));
    assert!(stdout.contains("Mode:            immediate"));
    assert!(stdout.contains("Privacy Mode:    enhanced"));
    assert!(stdout.contains("Events:          0"));
}

#[test]
fn emit_stores_sanitized_events_and_forms_batch() {
    let env = CliTestEnv::with_unreachable_collector(3);
    let events_file = env.home.join("events.json");
    fs::write(&events_file, events_json(4)).expect("failed to write events");

    let file_arg = events_file.to_string_lossy().into_owned();
    let args = ["emit", "--file", file_arg.as_str()];
    let output = env.run(&args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Accepted 4 of 4 event(s)"));

    let db = Database::open(&env.db_path()).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    assert_eq!(db.count_events().unwrap(), 4);

    let pending = db.list_batches(Some(BatchStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_ids.len(), 3);

    let stored = db.get_events(&pending[0].event_ids).unwrap();
    assert!(stored
        .iter()
        .all(|e| e.metadata.get("email").is_none() && e.metadata.contains_key("ad_id")));

    let batches = env.run(&["batches", "--status", "pending"]);
    assert_success(&["batches", "--status", "pending"], &batches);
    assert!(String::from_utf8_lossy(&batches.stdout).contains(&pending[0].batch_id));
}

#[test]
fn sync_against_unreachable_collector_retries_then_fails() {
    let env = CliTestEnv::with_unreachable_collector(2);
    let emit = env.run_with_stdin(&["emit"], &events_json(2));
    assert_success(&["emit"], &emit);

    let first = env.run(&["sync"]);
    assert_success(&["sync"], &first);
    assert!(String::from_utf8_lossy(&first.stdout).contains("Retrying:          1"));

    let second = env.run(&["sync"]);
    assert_success(&["sync"], &second);
    assert!(String::from_utf8_lossy(&second.stdout).contains("Failed:            1"));
    assert!(env.db_path().with_extension("db.runner.lock").exists());

    let failed = env.run(&["batches", "--status", "failed"]);
    assert_success(&["batches", "--status", "failed"], &failed);
    let stdout = String::from_utf8_lossy(&failed.stdout);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("last error:"));

    let db = Database::open(&env.db_path()).expect("failed to open db");
    let batch = db
        .list_batches(Some(BatchStatus::Failed))
        .unwrap()
        .remove(0);
    assert_eq!(batch.attempts, 2);
    assert_eq!(db.count_events().unwrap(), 2);

    let requeue = env.run(&["requeue", &batch.batch_id]);
    assert_success(&["requeue"], &requeue);
    assert_eq!(
        db.get_batch(&batch.batch_id).unwrap().unwrap().status,
        BatchStatus::Pending
    );
}

#[test]
fn invalid_input_and_missing_aggregate_fail() {
    let env = CliTestEnv::new();

    let emit = env.run_with_stdin(&["emit"], "{ not json");
    assert!(!emit.status.success());
    assert!(String::from_utf8_lossy(&emit.stderr).contains("input is not valid JSON"));

    let aggregate = env.run(&["aggregate", "impressions_2024-01-01"]);
    assert!(!aggregate.status.success());
    assert!(String::from_utf8_lossy(&aggregate.stderr).contains("aggregate not found"));

    let requeue = env.run(&["requeue", "missing-batch"]);
    assert!(!requeue.status.success());
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[pipeline]\nbatch_size = 0\n");

    let output = env.run(&["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("batch_size"));
}
