use std::net::TcpListener;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

use chrono::Utc;
use serial_test::serial;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_omnitrace")
}

struct Server {
    child: Child,
    port: u16,
}

impl Server {
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    fn cli(&self, args: &[&str]) -> Output {
        Command::new(bin())
            .args(args)
            .arg("--addr")
            .arg(self.addr())
            .output()
            .expect("run omnitrace cli")
    }

    fn cli_json(&self, args: &[&str]) -> serde_json::Value {
        let mut with_json = vec!["--json"];
        with_json.extend_from_slice(args);
        let output = self.cli(&with_json);
        assert!(
            output.status.success(),
            "cli {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("cli json output")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn spawn_server() -> Server {
    let port = free_port();
    let child = Command::new(bin())
        .arg("run")
        .arg("--http-addr")
        .arg(format!("127.0.0.1:{port}"))
        .env("OMNITRACE_CONFIG", "/nonexistent/omnitrace-e2e.toml")
        .env_remove("OMNITRACE_SELF_OBSERVE")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn omnitrace run");
    let mut server = Server { child, port };

    let client = reqwest::Client::new();
    let mut ready = false;
    for _ in 0..100 {
        assert!(
            server.child.try_wait().unwrap().is_none(),
            "omnitrace exited early"
        );
        if client.get(server.url("/api/status")).send().await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "collector not ready");
    server
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[serial]
async fn e2e_ingest_then_query_traces_and_status() {
    let server = spawn_server().await;
    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";
    let base = Utc::now() - chrono::Duration::minutes(1);
    let spans = testkit::sample_trace(trace_id, base);

    let resp = reqwest::Client::new()
        .post(server.url("/api/v1/spans"))
        .json(&serde_json::json!({ "spans": spans }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let listed = wait_for(|| {
        server
            .cli_json(&["traces", "--service", "db"])
            .as_array()
            .is_some_and(|a| a.len() == 1)
    })
    .await;
    assert!(listed, "trace never became queryable");

    let traces = server.cli_json(&["traces", "--errors", "--min-duration", "1s"]);
    assert_eq!(traces[0]["trace_id"], trace_id);
    assert_eq!(traces[0]["root_operation"], "GET /v1/orders");

    let output = server.cli(&["trace", trace_id]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains(&format!("TRACE {trace_id}")));
    assert!(stdout.contains("SELECT orders"));
    assert!(stdout.contains("error[timeout]: context deadline exceeded"));

    let status = server.cli_json(&["status"]);
    assert_eq!(status["traces"], 1);
    assert_eq!(status["spans"], 2);

    let services = server.cli_json(&["services"]);
    assert_eq!(services, serde_json::json!(["api", "db"]));
}

#[tokio::test]
#[serial]
async fn e2e_rejects_malformed_batches_and_unknown_traces() {
    let server = spawn_server().await;

    let resp = reqwest::Client::new()
        .post(server.url("/api/v1/spans"))
        .header("content-type", "application/json")
        .body("{\"spans\": [")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let output = server.cli(&["trace", "00000000000000000000000000000abc"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));

    let output = server.cli(&["traces", "--min-duration", "soon"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("400"));
}

#[tokio::test]
#[serial]
async fn e2e_demo_exports_through_the_sdk() {
    let server = spawn_server().await;

    let demo = server.cli_json(&["demo", "--traces", "3"]);
    assert_eq!(demo["trace_ids"].as_array().map(Vec::len), Some(3));

    let arrived = wait_for(|| {
        let status = server.cli_json(&["status"]);
        status["traces"] == 3 && status["metric_points"] == 3
    })
    .await;
    assert!(arrived, "demo traces never arrived");

    let services = server.cli_json(&["services"]);
    assert_eq!(services, serde_json::json!(["demo-api", "demo-db"]));

    let failing = server.cli_json(&["traces", "--errors"]);
    assert_eq!(failing.as_array().map(Vec::len), Some(1));

    let names = server.cli_json(&["metrics"]);
    assert_eq!(names, serde_json::json!(["request_duration_ms"]));

    let buckets = server.cli_json(&[
        "metrics",
        "request_duration_ms",
        "--since",
        "1h",
        "--step",
        "1h",
    ]);
    let total: u64 = buckets
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["count"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 3);
}
