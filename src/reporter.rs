use crate::results::BenchmarkResult;
use crate::{BenchmarkError, KernelVariant};
use console::Style;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;

const RULE: &str =
    "================================================================================";

/// One row of the bandwidth CSV
#[derive(Debug, Serialize)]
struct CsvRow {
    width: u32,
    height: u32,
    input_stride: u32,
    output_stride: u32,
    #[serde(rename = "bandwidth_GB_per_s")]
    bandwidth_gb_per_s: f64,
}

/// Variant name followed by what the kernel does, when the name is known
fn kernel_label(variant: &str) -> String {
    match variant.parse::<KernelVariant>() {
        Ok(v) => format!("{} ({})", v.name(), v.description()),
        Err(_) => variant.to_string(),
    }
}

/// Print a benchmark result to console
pub fn print_result(result: &BenchmarkResult) {
    let header_style = Style::new().bold().cyan();
    let label_style = Style::new().bold();
    let value_style = Style::new().green();
    let warn_style = Style::new().yellow();

    println!();
    println!("{}", header_style.apply_to(RULE));
    println!(
        "{}",
        header_style.apply_to("                        GPU BANDWIDTH BENCHMARK RESULT")
    );
    println!("{}", header_style.apply_to(RULE));
    println!();

    println!(
        "{}: {} ({})",
        label_style.apply_to("Device"),
        value_style.apply_to(&result.device),
        &result.backend
    );
    println!(
        "{}: {}",
        label_style.apply_to("Kernel"),
        kernel_label(&result.variant)
    );

    let d = &result.dimensions;
    println!(
        "{}: {} x {} (strides {} / {})",
        label_style.apply_to("Workload"),
        d.width,
        d.height,
        d.input_stride,
        d.output_stride
    );
    println!(
        "{}: {}",
        label_style.apply_to("Bytes moved"),
        result.bytes_moved
    );
    println!();

    match (result.duration_us(), result.bandwidth_gbps) {
        (Some(us), Some(gbps)) => {
            println!("{:<20} {:>14.3} us", label_style.apply_to("Duration"), us);
            println!(
                "{:<20} {:>14}",
                label_style.apply_to("Bandwidth"),
                value_style.apply_to(format!("{:.3} GB/s", gbps))
            );
        }
        _ => {
            let reason = result
                .anomaly
                .map(|a| a.describe())
                .unwrap_or("no duration");
            println!(
                "{} {}",
                warn_style.apply_to("Timing anomaly:"),
                warn_style.apply_to(reason)
            );
            println!(
                "ticks: start {} end {}",
                result.interval.start_ticks, result.interval.end_ticks
            );
        }
    }

    if let Some(v) = &result.verification {
        let status = if v.passed() {
            value_style.apply_to(format!("passed ({} elements)", v.checked))
        } else {
            warn_style.apply_to(format!("{} of {} mismatched", v.mismatches, v.checked))
        };
        println!("{:<20} {}", label_style.apply_to("Verification"), status);
        if let Some((index, want, got)) = v.first_mismatch {
            println!("- first mismatch at {}: expected {}, got {}", index, want, got);
        }
    }

    if !result.counters.is_empty() {
        println!();
        println!("{}", label_style.apply_to("Hardware Counters:"));
        println!("{}", "-".repeat(80));
        for (name, value) in &result.counters {
            println!("{:<25} {:>16.0}", name, value);
        }
    }

    println!();
    println!("{}", header_style.apply_to(RULE));
    println!();
}

/// Append one row to the bandwidth CSV, writing the header only when the
/// file is new or empty. Anomalous results are not written.
pub fn append_csv(path: &Path, result: &BenchmarkResult) -> Result<bool, BenchmarkError> {
    let Some(bandwidth) = result.bandwidth_gbps else {
        return Ok(false);
    };

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let empty = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(empty)
        .from_writer(file);

    let d = &result.dimensions;
    writer.serialize(CsvRow {
        width: d.width,
        height: d.height,
        input_stride: d.input_stride,
        output_stride: d.output_stride,
        bandwidth_gb_per_s: bandwidth,
    })?;
    writer.flush()?;
    Ok(true)
}

/// Export the full result to a JSON file
pub fn export_json(result: &BenchmarkResult, path: &Path) -> Result<(), BenchmarkError> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)?;
    Ok(())
}
