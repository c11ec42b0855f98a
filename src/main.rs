//! dr-tree entry point: CLI wiring and a simulated run of a configured tree.

use std::path::Path;
use std::process;

use dr_tree::config::TreeConfig;
use dr_tree::logline::export_csv;
use dr_tree::sim;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    seed_override: Option<u64>,
    hours_override: Option<u32>,
    log_out: Option<String>,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("dr-tree: hierarchical demand-response control tree simulator");
    eprintln!();
    eprintln!("Usage: dr-tree [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load the tree from a TOML config file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        TreeConfig::PRESETS.join(", ")
    );
    eprintln!("  --seed <u64>             Override random seed");
    eprintln!("  --hours <u32>            Override simulated duration");
    eprintln!("  --log-out <path>         Export aggregator log records to CSV");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Start REST API server after the run");
        eprintln!("  --port <u16>             API server port (default: 3000)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the single_bus preset is used.");
    eprintln!("Log verbosity follows RUST_LOG (default: info).");
}

/// Returns the value following flag `args[*i]`, exiting if it is missing.
fn flag_value<'a>(args: &'a [String], i: &mut usize, what: &str) -> &'a str {
    let flag = &args[*i];
    *i += 1;
    match args.get(*i) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("error: {flag} requires {what}");
            process::exit(1);
        }
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str, kind: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("error: {flag} value \"{value}\" is not a valid {kind}");
        process::exit(1);
    })
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        seed_override: None,
        hours_override: None,
        log_out: None,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 3000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                cli.scenario_path = Some(flag_value(&args, &mut i, "a path argument").to_string());
            }
            "--preset" => {
                cli.preset = Some(flag_value(&args, &mut i, "a name argument").to_string());
            }
            "--seed" => {
                let value = flag_value(&args, &mut i, "a u64 argument");
                cli.seed_override = Some(parse_number("--seed", value, "u64"));
            }
            "--hours" => {
                let value = flag_value(&args, &mut i, "a u32 argument");
                cli.hours_override = Some(parse_number("--hours", value, "u32"));
            }
            "--log-out" => {
                cli.log_out = Some(flag_value(&args, &mut i, "a path argument").to_string());
            }
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                let value = flag_value(&args, &mut i, "a u16 argument");
                cli.port = parse_number("--port", value, "u16");
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = parse_args();
    init_tracing();

    // --scenario takes priority, then --preset, then single_bus
    let loaded = if let Some(ref path) = cli.scenario_path {
        TreeConfig::from_toml_file(Path::new(path))
    } else if let Some(ref name) = cli.preset {
        TreeConfig::from_preset(name)
    } else {
        Ok(TreeConfig::single_bus())
    };
    let mut config = loaded.unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(1);
    });

    if let Some(seed) = cli.seed_override {
        config.simulation.seed = seed;
    }
    if let Some(hours) = cli.hours_override {
        config.simulation.hours = hours;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let result = sim::run(&config).unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(1);
    });

    for node in &result.nodes {
        println!("{}\n", node.description);
    }
    println!("{}", result.summary);

    if let Some(ref path) = cli.log_out {
        if let Err(e) = export_csv(&result.lines, Path::new(path)) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("{} log records written to {path}", result.lines.len());
    }

    #[cfg(feature = "api")]
    if cli.serve {
        use std::net::SocketAddr;
        use std::sync::Arc;

        let state = Arc::new(dr_tree::api::AppState::from(result));
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });
        if let Err(e) = rt.block_on(dr_tree::api::serve(state, addr)) {
            eprintln!("error: API server failed: {e}");
            process::exit(1);
        }
    }
}
