use gpu_timing_bench::config::Dimensions;
use gpu_timing_bench::reporter::{append_csv, export_json};
use gpu_timing_bench::results::{throughput_gbps, BenchmarkResult};
use gpu_timing_bench::timestamp::TimestampInterval;
use gpu_timing_bench::{Backend, KernelVariant};
use std::path::PathBuf;

const HEADER: &str = "width,height,input_stride,output_stride,bandwidth_GB_per_s";

fn temp_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "gpu-timing-bench-{}-{}",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&path);
    path
}

fn result(dims: Dimensions, start: u64, end: u64) -> BenchmarkResult {
    BenchmarkResult::from_interval(
        "Simulated Device".to_string(),
        Backend::Simulated,
        KernelVariant::LinearCopy,
        dims,
        dims.elements() * 4,
        TimestampInterval {
            start_ticks: start,
            end_ticks: end,
            tick_frequency: 1e9,
        },
    )
}

#[test]
fn throughput_matches_manual_reference() {
    let bytes = 8u64 * 8 * 4;
    let duration = 1e-7;
    let reference = 256.0 / 1e-7 / (1024.0 * 1024.0 * 1024.0);
    assert!((throughput_gbps(bytes, duration) - reference).abs() < 1e-9);
    assert!((throughput_gbps(bytes, duration) - 2.384).abs() < 1e-3);

    let big = 2000u64 * 2000 * 4;
    let reference = big as f64 / 0.0025 / 1_073_741_824.0;
    assert!((throughput_gbps(big, 0.0025) - reference).abs() < 1e-9);
}

#[test]
fn csv_header_is_written_once() {
    let path = temp_path("append.csv");
    for i in 0..3u32 {
        let dims = Dimensions::new(8 * (i + 1), 8).with_strides(8 * (i + 1), 16 * (i + 1));
        assert!(append_csv(&path, &result(dims, 0, 100)).unwrap());
    }

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], HEADER);
    for line in &lines[1..] {
        assert_eq!(line.split(',').count(), 5, "bad row: {}", line);
    }
    assert!(lines[1].starts_with("8,8,8,16,"));

    append_csv(&path, &result(Dimensions::new(8, 8), 0, 100)).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().filter(|l| *l == HEADER).count(), 1);
    assert_eq!(text.lines().count(), 5);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn existing_non_empty_file_gets_no_header() {
    let path = temp_path("existing.csv");
    std::fs::write(&path, "previous,run\n").unwrap();
    append_csv(&path, &result(Dimensions::new(8, 8), 0, 100)).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "previous,run");
    assert!(!text.contains(HEADER));

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn anomalous_results_are_not_appended() {
    let path = temp_path("anomaly.csv");
    assert!(!append_csv(&path, &result(Dimensions::new(8, 8), 100, 100)).unwrap());
    assert!(!path.exists());
}

#[test]
fn json_export_carries_the_measurement() {
    let path = temp_path("result.json");
    export_json(&result(Dimensions::new(8, 8), 0, 100), &path).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["bytes_moved"], 256);
    assert_eq!(value["variant"], "linear_copy");
    assert!((value["bandwidth_gbps"].as_f64().unwrap() - 2.384).abs() < 1e-3);
    assert!(value["anomaly"].is_null());

    std::fs::remove_file(&path).unwrap();
}
