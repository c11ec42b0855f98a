use std::process::Command;

use dr_tree::config::TreeConfig;
use dr_tree::logline::export_csv;
use dr_tree::node::ControlMode;
use dr_tree::sim::{self, SimResult};

fn run_for_an_hour(mut config: TreeConfig) -> SimResult {
    config.simulation.hours = 1;
    sim::run(&config).expect("config should be valid")
}

#[test]
fn presets_run_and_end_under_contract() {
    for name in TreeConfig::PRESETS {
        let config = TreeConfig::from_preset(name).expect("preset exists");
        let expected_nodes = config.aggregators.len() + config.leaves.len();
        let result = run_for_an_hour(config);

        assert!(!result.lines.is_empty(), "{name}: no log records");
        assert_eq!(result.nodes.len(), expected_nodes, "{name}: missing nodes");
        let root = result
            .nodes
            .iter()
            .find(|n| n.parent.is_none())
            .expect("root snapshot");
        assert_eq!(root.mode, ControlMode::Contract, "{name}: root not under contract");
        assert!(result.summary.contract_records > 0, "{name}: no contract records");
        assert!(result.summary.peak_demand_watts > 0.0);
    }
}

#[test]
fn feeders_log_alongside_the_bus() {
    let result = run_for_an_hour(TreeConfig::two_level());
    for id in ["bus_0", "feeder_a", "feeder_b"] {
        assert!(
            result.lines.iter().any(|l| l.id == id),
            "expected log records from {id}"
        );
    }
    // Leaves do not log.
    assert!(!result.lines.iter().any(|l| l.id.starts_with("hvac_")));
}

#[test]
fn csv_export_writes_one_row_per_record() {
    let result = run_for_an_hour(TreeConfig::single_bus());
    let path = std::env::temp_dir().join(format!("dr-tree-log-{}.csv", std::process::id()));
    export_csv(&result.lines, &path).expect("csv export");

    let content = std::fs::read_to_string(&path).expect("csv readable");
    std::fs::remove_file(&path).ok();
    let mut rows = content.lines();
    let header = rows.next().expect("header row");
    assert!(header.starts_with("id,"));
    assert_eq!(rows.count(), result.lines.len());
}

#[test]
fn scenario_file_parses_and_runs() {
    let config = TreeConfig::from_toml_file(std::path::Path::new("scenarios/feeders.toml"))
        .expect("scenario parses");
    assert!(config.validate().is_empty());
    assert_eq!(config.root(), Some("bus_0"));
    assert_eq!(config.leaves.len(), 4);

    let result = run_for_an_hour(config);
    assert_eq!(result.summary.root, "bus_0");
    assert!(result.summary.contract_records > 0);
}

#[test]
fn cli_prints_run_summary() {
    let output = Command::new(env!("CARGO_BIN_EXE_dr-tree"))
        .args(["--preset", "single_bus", "--hours", "1", "--seed", "3"])
        .output()
        .expect("dr-tree process should run");

    assert!(
        output.status.success(),
        "run failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be valid UTF-8");
    assert!(stdout.contains("--- Run Summary (bus_0) ---"), "stdout: {stdout}");
    let records = parse_metric(&stdout, "Under contract:");
    assert!(records > 0.0);
}

#[test]
fn cli_rejects_unknown_preset() {
    let output = Command::new(env!("CARGO_BIN_EXE_dr-tree"))
        .args(["--preset", "nope"])
        .output()
        .expect("dr-tree process should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown preset"));
}

fn parse_metric(stdout: &str, label: &str) -> f64 {
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with(label))
        .unwrap_or_else(|| panic!("missing line `{label}` in output: {stdout}"));
    let raw = line
        .split_once(':')
        .map(|(_, right)| right.trim())
        .unwrap_or_else(|| panic!("invalid format for line `{line}`"));
    let numeric = raw.split_whitespace().next().unwrap_or(raw);
    numeric
        .parse::<f64>()
        .unwrap_or_else(|_| panic!("failed parsing `{numeric}` from line `{line}`"))
}
