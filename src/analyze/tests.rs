use super::*;
use std::fs;

const REQ: &str = "5f0c6a1e-2b7d-4c1a-9f3e-0d8b7a6c5e4f";

fn step(step: u64, elapsed: f64, layer: f64, calls: u64) -> StepRecord {
    StepRecord {
        step,
        elapsed_backend: elapsed,
        layer_time: layer,
        npu_calls: calls,
    }
}

fn sample(elapsed: f64, pct: Option<f64>) -> TraceSample {
    TraceSample {
        timestamp: String::new(),
        elapsed_s: elapsed,
        npu_pct: pct,
    }
}

fn write_run(dir: &Path) {
    fs::write(
        dir.join(TRACE_FILE),
        "timestamp,elapsed_s,npu_pct\n\
         2026-01-01T00:00:00.000000Z,0.000000,0\n\
         2026-01-01T00:00:00.500000Z,0.500000,\n\
         2026-01-01T00:00:01.000000Z,1.000000,40\n\
         2026-01-01T00:00:01.500000Z,1.500000,60\n\
         2026-01-01T00:00:02.000000Z,2.000000,80\n\
         2026-01-01T00:00:02.500000Z,2.500000,2\n",
    )
    .expect("test");
    fs::write(
        dir.join(GENERATIONS_FILE),
        format!(
            "{{\"prompt\":\"a\",\"status_code\":null,\"elapsed_s\":0.1,\"error\":\"refused\"}}\n\
             {{\"prompt\":\"b\",\"status_code\":200,\"elapsed_s\":2.4,\"text\":\"x\",\"request_id\":\"{REQ}\"}}\n"
        ),
    )
    .expect("test");
    fs::write(
        dir.join(FILTERED_LOG_FILE),
        format!(
            "2026-01-01T00:00:00Z  INFO axbridge::engine::decode: REQ {REQ}: generate start, prompt_len=1\n\
             2026-01-01T00:00:00Z  INFO axbridge::engine::decode: REQ other: step=0 elapsed=9.000000s step_layer_time=9.000000s npu_calls=1\n\
             2026-01-01T00:00:01Z  INFO axbridge::engine::decode: REQ {REQ}: step=0 elapsed=0.500000s step_layer_time=0.400000s npu_calls=37\n\
             2026-01-01T00:00:01Z  INFO axbridge::engine::decode: REQ {REQ}: step=1 elapsed=1.000000s step_layer_time=0.300000s npu_calls=74\n"
        ),
    )
    .expect("test");
}

#[test]
fn test_parse_step_lines_filters_by_request() {
    let log = format!(
        "INFO:__main__:REQ {REQ}: step=0 elapsed=1.087803s step_layer_time=0.910048s npu_calls=37\n\
         INFO:__main__:REQ abc: step=0 elapsed=5.0s step_layer_time=4.0s npu_calls=37\n\
         INFO:__main__:REQ {REQ}: EOS token generated\n"
    );
    let steps = parse_step_lines(log.as_bytes(), REQ).expect("test");
    assert_eq!(steps, vec![step(0, 1.087803, 0.910048, 37)]);
}

#[test]
fn test_request_id_is_matched_literally() {
    let log = "REQ a1b2: step=0 elapsed=1.0s step_layer_time=0.5s npu_calls=1\n";
    assert!(parse_step_lines(log.as_bytes(), "a.b.").expect("test").is_empty());
}

#[test]
fn test_offset_aligns_last_active_sample_with_last_step() {
    let steps = [step(0, 0.5, 0.4, 37), step(1, 1.0, 0.3, 74)];
    let trace = [
        sample(0.0, Some(0.0)),
        sample(1.0, Some(40.0)),
        sample(2.0, Some(80.0)),
        sample(2.5, Some(2.0)),
    ];
    assert!((alignment_offset(&steps, &trace) - 1.0).abs() < 1e-9);
}

#[test]
fn test_offset_is_zero_without_activity() {
    let steps = [step(0, 0.5, 0.4, 37)];
    let trace = [sample(0.0, Some(3.0)), sample(1.0, None)];
    assert_eq!(alignment_offset(&steps, &trace), 0.0);
}

#[test]
fn test_align_steps_windows_and_overhead() {
    let steps = [step(0, 0.5, 0.4, 37), step(1, 1.0, 0.3, 74)];
    let trace = [
        sample(1.0, Some(40.0)),
        sample(1.5, Some(60.0)),
        sample(2.0, Some(80.0)),
    ];
    let rows = align_steps(&steps, &trace, 1.0);

    assert!((rows[0].estimated_trace_time - 1.5).abs() < 1e-9);
    assert!((rows[0].npu_avg_pct - 50.0).abs() < 1e-9);
    assert!((rows[0].step_duration - 0.5).abs() < 1e-9);
    assert!((rows[0].overhead - 0.1).abs() < 1e-9);

    // shared boundary sample counts in both windows
    assert!((rows[1].npu_avg_pct - 70.0).abs() < 1e-9);
    assert!((rows[1].step_duration - 0.5).abs() < 1e-9);
    assert!((rows[1].overhead - 0.2).abs() < 1e-9);
}

#[test]
fn test_empty_window_averages_zero() {
    let rows = align_steps(&[step(0, 0.1, 0.1, 1)], &[sample(5.0, Some(90.0))], 0.0);
    assert_eq!(rows[0].npu_avg_pct, 0.0);
}

#[test]
fn test_analyze_dir_writes_report() {
    let dir = tempfile::tempdir().expect("test");
    write_run(dir.path());

    let summary = analyze_dir(dir.path(), None).expect("test");
    assert_eq!(summary.request_id, REQ);
    assert!((summary.request_elapsed_s - 2.4).abs() < 1e-9);
    assert_eq!(summary.steps, 2);
    assert!((summary.offset_s - 1.0).abs() < 1e-9);
    assert_eq!(summary.total_npu_calls, 74);
    assert!((summary.avg_step_duration - 0.5).abs() < 1e-9);
    assert!((summary.avg_npu_pct - 60.0).abs() < 1e-9);

    let mut reader = csv::Reader::from_path(&summary.report_file).expect("test");
    let headers: Vec<String> = reader
        .headers()
        .expect("test")
        .iter()
        .map(str::to_string)
        .collect();
    assert_eq!(
        headers,
        [
            "step",
            "elapsed_backend",
            "layer_time",
            "npu_calls",
            "estimated_trace_time",
            "npu_avg_pct",
            "step_duration",
            "overhead"
        ]
    );
    assert_eq!(reader.records().count(), 2);
}

#[test]
fn test_analyze_without_request_id_fails() {
    let dir = tempfile::tempdir().expect("test");
    write_run(dir.path());
    fs::write(dir.path().join(GENERATIONS_FILE), "{\"prompt\":\"a\",\"elapsed_s\":1.0}\n").expect("test");
    let err = analyze_dir(dir.path(), None).unwrap_err();
    assert!(err.to_string().contains("No request_id"));
}

#[test]
fn test_analyze_without_step_lines_fails() {
    let dir = tempfile::tempdir().expect("test");
    write_run(dir.path());
    let empty_log = dir.path().join("empty.log");
    fs::write(&empty_log, "nothing here\n").expect("test");
    let err = analyze_dir(dir.path(), Some(&empty_log)).unwrap_err();
    assert!(err.to_string().contains("No step logs"));
}
