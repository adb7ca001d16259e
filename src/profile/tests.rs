use super::*;
use crate::test_helpers::{echo_state, spawn_proxy};

const SMI_OUTPUT: &str = "\
+------------------------------------------------------------------------------------------------+
| Card  Name                     Firmware         | Bus-Id       | Memory-Usage                  |
| Fan   Temp                Pwr:Usage/Cap         | CPU      NPU | CMM-Usage                     |
|=================================================+==============+===============================|
|    0  AX650N                    V2.26.1         | 0000:01:00.0 |                171 MiB /      945 MiB |
|   --   52C                      -- / --         | 2%        27% |               4747 MiB /     7040 MiB |
+------------------------------------------------------------------------------------------------+";

fn fast_profile(backend_url: String, out_dir: PathBuf) -> ProfileConfig {
    ProfileConfig {
        backend_url,
        out_dir,
        interval: Duration::from_millis(5),
        duration: Duration::from_secs(5),
        settle: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        prompts_file: None,
    }
}

#[test]
fn test_parse_npu_usage_reads_second_percentage() {
    assert_eq!(parse_npu_usage(SMI_OUTPUT), Some(27));
    assert_eq!(parse_npu_usage("| 0%        0% |"), Some(0));
}

#[test]
fn test_parse_npu_usage_without_table() {
    assert_eq!(parse_npu_usage(""), None);
    assert_eq!(parse_npu_usage("axcl-smi: no device found"), None);
}

#[test]
fn test_missing_smi_tool_yields_none() {
    let mut probe = SmiProbe::with_command("/nonexistent/axcl-smi");
    assert_eq!(probe.sample(), None);
}

#[test]
fn test_tracer_writes_csv_rows() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join(TRACE_FILE);
    let mut n = 0;
    let probe = move || {
        n += 10;
        Some(n)
    };
    let tracer = NpuTracer::start(&path, probe, Duration::from_millis(5), Duration::from_secs(5))
        .expect("test");
    std::thread::sleep(Duration::from_millis(60));
    let rows = tracer.stop().expect("test");
    assert!(rows >= 2);

    let mut reader = csv::Reader::from_path(&path).expect("test");
    let headers: Vec<String> = reader
        .headers()
        .expect("test")
        .iter()
        .map(str::to_string)
        .collect();
    assert_eq!(headers, ["timestamp", "elapsed_s", "npu_pct"]);
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("test")).collect();
    assert_eq!(records.len(), rows);
    assert_eq!(&records[0][2], "10");
    assert!(records[0][0].ends_with('Z'));
    let first: f64 = records[0][1].parse().expect("test");
    let last: f64 = records[rows - 1][1].parse().expect("test");
    assert!(last > first);
}

#[test]
fn test_tracer_leaves_unavailable_samples_empty() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join(TRACE_FILE);
    let tracer = NpuTracer::start(&path, || None, Duration::from_millis(5), Duration::from_millis(30))
        .expect("test");
    std::thread::sleep(Duration::from_millis(50));
    tracer.stop().expect("test");

    let mut reader = csv::Reader::from_path(&path).expect("test");
    let record = reader.records().next().expect("test").expect("test");
    assert_eq!(&record[2], "");
}

#[test]
fn test_tracer_stops_at_duration() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join(TRACE_FILE);
    let tracer = NpuTracer::start(&path, || Some(1), Duration::from_millis(10), Duration::from_millis(25))
        .expect("test");
    std::thread::sleep(Duration::from_millis(150));
    let rows = tracer.stop().expect("test");
    assert!((1..=4).contains(&rows));
}

#[test]
fn test_read_prompts_skips_blank_lines() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("prompts.txt");
    fs::write(&path, "What is AI?\n\n   \n  Tell me a joke.  \n").expect("test");
    let prompts = read_prompts(&path).expect("test");
    assert_eq!(prompts, vec!["What is AI?", "Tell me a joke."]);
    assert!(read_prompts(&dir.path().join("missing.txt")).is_err());
}

#[test]
fn test_generations_record_transport_errors() {
    let dir = tempfile::tempdir().expect("test");
    let out = dir.path().join(GENERATIONS_FILE);
    let adapter = BackendAdapter::new("http://127.0.0.1:9", Duration::from_millis(300)).expect("test");
    let records = run_generations(&adapter, &["hi".to_string()], &out).expect("test");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, None);
    assert!(records[0].error.is_some());

    let line = fs::read_to_string(&out).expect("test");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("test");
    assert!(value["status_code"].is_null());
    assert!(value.get("text").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generations_capture_text_and_request_id() {
    let url = spawn_proxy(echo_state()).await;
    let dir = tempfile::tempdir().expect("test");
    let out = dir.path().join(GENERATIONS_FILE);
    let out_path = out.clone();
    let records = tokio::task::spawn_blocking(move || {
        let adapter = BackendAdapter::new(url, Duration::from_secs(5)).expect("test");
        let prompts = vec!["one".to_string(), "two".to_string()];
        run_generations(&adapter, &prompts, &out_path)
    })
    .await
    .expect("test")
    .expect("test");

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status_code, Some(200));
    assert_eq!(records[1].text.as_deref(), Some("Echo: two"));
    assert!(records[1].request_id.is_some());

    let lines: Vec<GenerationRecord> = fs::read_to_string(&out)
        .expect("test")
        .lines()
        .map(|l| serde_json::from_str(l).expect("test"))
        .collect();
    assert_eq!(lines, records);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_profile_writes_result_directory() {
    let url = spawn_proxy(echo_state()).await;
    let dir = tempfile::tempdir().expect("test");
    let config = fast_profile(url, dir.path().to_path_buf());
    let summary = tokio::task::spawn_blocking(move || {
        run_profile(&config, &["What is AI?".to_string()], || Some(42))
    })
    .await
    .expect("test")
    .expect("test");

    assert_eq!(summary.num_prompts, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(summary.trace_samples > 0);
    let run_dir = summary.trace_file.parent().expect("test");
    assert_eq!(run_dir.file_name().expect("test").to_string_lossy(), summary.timestamp);
    assert!(summary.results_file.exists());

    let written: ProfileSummary =
        serde_json::from_slice(&fs::read(run_dir.join(SUMMARY_FILE)).expect("test")).expect("test");
    assert_eq!(written, summary);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_verify_npu_activity_reports_peak() {
    let url = spawn_proxy(echo_state()).await;
    let activity = tokio::task::spawn_blocking(move || {
        let adapter = BackendAdapter::new(url, Duration::from_secs(5)).expect("test");
        let mut readings = [0, 15, 60, 30].into_iter().cycle();
        verify_npu_activity(
            &adapter,
            move || readings.next(),
            Duration::from_millis(80),
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
    })
    .await
    .expect("test")
    .expect("test");

    assert!(activity.detected());
    assert_eq!(activity.peak_pct, 60);
    assert!(activity.active_samples < activity.samples);
    assert_eq!(activity.response_chars, Some(VERIFY_PROMPT.len() + "Echo: ".len()));
    assert!(activity.error.is_none());
}

#[test]
fn test_verify_without_readings_is_not_detected() {
    let adapter = BackendAdapter::new("http://127.0.0.1:9", Duration::from_millis(200)).expect("test");
    let activity = verify_npu_activity(
        &adapter,
        || None,
        Duration::from_millis(30),
        Duration::from_millis(5),
        Duration::ZERO,
    )
    .expect("test");
    assert!(!activity.detected());
    assert!(activity.error.is_some());
}
