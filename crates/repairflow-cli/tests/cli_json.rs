use assert_cmd::Command;
use serde_json::{Value, json};
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use tempfile::TempDir;

fn command(workspace: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("repairflow"));
    cmd.current_dir(workspace).env("HOME", workspace);
    cmd
}

fn run_json(workspace: &Path, args: &[&str]) -> Value {
    let output = command(workspace)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

fn write_settings(workspace: &Path, settings: &Value) {
    let runtime = workspace.join(".repairflow");
    fs::create_dir_all(&runtime).expect("runtime dir");
    fs::write(
        runtime.join("settings.local.json"),
        serde_json::to_vec_pretty(settings).expect("settings json"),
    )
    .expect("settings override");
}

fn chat_body(text: &str) -> String {
    json!({
        "model": "mock",
        "choices": [{"message": {"content": text}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 20, "completion_tokens": 5}
    })
    .to_string()
}

/// Serves `replies` in order, one connection each, then stops accepting.
fn start_mock_server(replies: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            consume_request(&mut stream);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    format!("http://{addr}/v1/chat/completions")
}

fn consume_request(stream: &mut TcpStream) {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let Ok(read) = stream.read(&mut chunk) else {
            return;
        };
        if read == 0 {
            return;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let text = String::from_utf8_lossy(&buffer);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }
}

fn mock_settings(endpoint: &str) -> Value {
    json!({
        "llm": {
            "provider": "mock",
            "model": "mock-model",
            "endpoint": endpoint,
            "api_key": "test-key",
            "api_key_env": "REPAIRFLOW_TEST_UNSET_KEY",
            "timeout_seconds": 10
        },
        "retry": {
            "quality_threshold": 0,
            "base_delay_ms": 0,
            "max_delay_ms": 0,
            "transport": "primary-only"
        }
    })
}

fn write_task(dataset: &Path, rel: &str) -> std::path::PathBuf {
    let task = dataset.join(rel);
    fs::create_dir_all(task.join("premerge")).expect("premerge");
    fs::write(task.join("01_proto.txt"), "syntax = \"proto3\";\n").expect("proto");
    fs::write(
        task.join("premerge/main.go"),
        "package main\n\nfunc main() {}\n",
    )
    .expect("main.go");
    task
}

fn two_turn_replies() -> Vec<String> {
    vec![
        chat_body("%_Reply Required_%\n[{\"type\": \"FILE_CONTENT\", \"path\": \"main.go\"}]"),
        chat_body("%_Thought_%\nNothing needs to change.\n%%_Fin_%%"),
    ]
}

#[test]
fn config_show_redacts_api_key() {
    let workspace = TempDir::new().expect("workspace");
    write_settings(
        workspace.path(),
        &json!({"llm": {"model": "gpt-test", "api_key": "sk-secret"}}),
    );
    let out = run_json(workspace.path(), &["--json", "config", "show"]);
    assert_eq!(out["llm"]["model"], "gpt-test");
    assert_eq!(out["llm"]["api_key"], "***REDACTED***");
    assert_eq!(out["flow"]["max_turns"], 15);
}

#[test]
fn flags_override_settings() {
    let workspace = TempDir::new().expect("workspace");
    write_settings(workspace.path(), &json!({"llm": {"model": "gpt-test"}}));
    let out = run_json(
        workspace.path(),
        &["--json", "--model", "other-model", "--max-turns", "4", "config", "show"],
    );
    assert_eq!(out["llm"]["model"], "other-model");
    assert_eq!(out["flow"]["max_turns"], 4);
}

#[test]
fn run_with_missing_task_dir_fails() {
    let workspace = TempDir::new().expect("workspace");
    let output = command(workspace.path())
        .args(["run", "--task-dir", "does/not/exist"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("task directory not found"), "{stderr}");
}

#[test]
fn run_completes_against_mock_endpoint() {
    let workspace = TempDir::new().expect("workspace");
    let endpoint = start_mock_server(two_turn_replies());
    write_settings(workspace.path(), &mock_settings(&endpoint));
    let task = write_task(&workspace.path().join("dataset"), "echo/handlers/t1");

    let out = run_json(
        workspace.path(),
        &["--json", "run", "--task-dir", task.to_string_lossy().as_ref()],
    );
    assert_eq!(out["status"], "Completed");
    assert_eq!(out["turns"], 2);
    assert_eq!(out["transport"], "primary");
    assert_eq!(out["tokens"]["prompt_tokens"], 40);

    let log_dir = workspace.path().join("logs/echo/handlers/t1");
    assert_eq!(fs::read_dir(&log_dir).expect("log dir").count(), 1);
}

#[test]
fn batch_writes_summary_for_filtered_tasks() {
    let workspace = TempDir::new().expect("workspace");
    let endpoint = start_mock_server(two_turn_replies());
    write_settings(workspace.path(), &mock_settings(&endpoint));
    let dataset = workspace.path().join("dataset");
    write_task(&dataset, "echo/handlers/t1");
    write_task(&dataset, "echo/handlers/t2");

    let out = run_json(
        workspace.path(),
        &["--json", "batch", "--dataset", "dataset", "--filter", "t2"],
    );
    assert_eq!(out["total_tasks"], 1);
    assert_eq!(out["tasks"][0]["id"], "echo/handlers/t2");
    assert_eq!(out["tasks"][0]["status"], "Completed");
    assert_eq!(out["counts"]["completed"], 1);

    let summary: Value = serde_json::from_slice(
        &fs::read(workspace.path().join("output/batch_summary.json")).expect("summary file"),
    )
    .expect("summary json");
    assert_eq!(summary["total_tasks"], 1);
    assert!(workspace.path().join("output/echo/handlers/t2").is_dir());
}
