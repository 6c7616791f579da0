// Main CLI entry point for Surrogate
// Feeds a capture set through the live pipeline and reports the verdicts

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{info, warn};

use surrogate::capture::load_path;
use surrogate::config;
use surrogate::engine::{ReqwestTransport, ScopeMatcher, TransportOptions};
use surrogate::error::Result;
use surrogate::log::ResultLog;
use surrogate::logging::{init_logging, LoggingConfig};
use surrogate::orchestrator::{Orchestrator, DEFAULT_WORKERS};
use surrogate::persistence::SettingsStore;
use surrogate::reporting::{export_csv, export_html, export_json, ReportFilter};
use surrogate::state::ReplayState;

fn cli() -> Command {
    Command::new("surrogate")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Jake Abendroth")
        .about("Replays captured HTTP traffic as other users to find broken access control")
        .after_help("EXAMPLES:\n  surrogate --input capture.har --user-header 'Cookie: session=low-priv'\n  surrogate -i captures/ --config autorize.json --scope-include '*.example.com' --html-report --report-filter bypassed\n\nVERDICTS:\n  Enforced!        the replay was refused (401/403, denial text or enforcement rule)\n  Bypassed!        the replay got the same status as the original\n  Is enforced???   anything else")
        .arg(Arg::new("input")
            .short('i')
            .long("input")
            .required(true)
            .num_args(1)
            .help("Capture file (.json or .har) or directory of capture files"))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .num_args(1)
            .help("JSON configuration to import (profiles, rules, filters)"))
        .arg(Arg::new("settings")
            .long("settings")
            .num_args(1)
            .help("Persisted settings file, loaded at start and saved on change"))
        .arg(Arg::new("user_header")
            .short('u')
            .long("user-header")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Header line for the first profile, e.g. 'Cookie: session=abc' (repeatable)"))
        .arg(Arg::new("workers")
            .short('w')
            .long("workers")
            .num_args(1)
            .value_parser(clap::value_parser!(usize))
            .default_value("10")
            .help("Parallel replay tasks"))
        .arg(Arg::new("scope_include")
            .long("scope-include")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Host wildcard that is in scope (repeatable; default: all hosts)"))
        .arg(Arg::new("scope_exclude")
            .long("scope-exclude")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Host wildcard that is out of scope (repeatable; wins over --scope-include)"))
        .arg(Arg::new("no_unauth")
            .long("no-unauth")
            .action(ArgAction::SetTrue)
            .help("Skip the unauthenticated replay"))
        .arg(Arg::new("replace_query")
            .long("replace-query")
            .num_args(1)
            .help("Set one query parameter on every replay as key=value, e.g. 'id=1'; overrides the parameter when present, appends it otherwise"))
        .arg(Arg::new("insecure")
            .short('k')
            .long("insecure")
            .action(ArgAction::SetTrue)
            .help("Accept invalid TLS certificates"))
        .arg(Arg::new("timeout")
            .long("timeout")
            .num_args(1)
            .value_parser(clap::value_parser!(u64))
            .default_value("30")
            .help("Per-request timeout in seconds"))
        .arg(Arg::new("csv_report")
            .long("csv-report")
            .action(ArgAction::SetTrue)
            .help("Output CSV report (default: on)"))
        .arg(Arg::new("json_report")
            .long("json-report")
            .action(ArgAction::SetTrue)
            .help("Output JSON report"))
        .arg(Arg::new("html_report")
            .long("html-report")
            .action(ArgAction::SetTrue)
            .help("Output HTML report"))
        .arg(Arg::new("report_filter")
            .long("report-filter")
            .num_args(1)
            .default_value("all")
            .help("HTML rows to keep: all, table, enforced, bypassed, unknown, disabled"))
        .arg(Arg::new("report_dir")
            .long("report-dir")
            .num_args(1)
            .default_value(".")
            .help("Directory reports are written to"))
        .arg(Arg::new("export_config")
            .long("export-config")
            .num_args(1)
            .help("Write the effective configuration as JSON to this path"))
        .arg(Arg::new("log_level")
            .long("log-level")
            .num_args(1)
            .default_value("info")
            .help("Log level (trace, debug, info, warn, error); RUST_LOG overrides"))
        .arg(Arg::new("log_json")
            .long("log-json")
            .action(ArgAction::SetTrue)
            .help("Emit logs as JSON"))
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn configure(state: &ReplayState, matches: &ArgMatches) -> Result<()> {
    if let Some(path) = matches.get_one::<String>("config") {
        config::load_file(state, Path::new(path))?;
        info!("Imported configuration from {}", path);
    }

    let user_headers = strings(matches, "user_header");
    if !user_headers.is_empty() {
        if let Some(first) = state.snapshot().profiles.first().map(|p| p.id()) {
            state.update_profile_headers(first, user_headers.join("\n"))?;
        }
    }

    let no_unauth = matches.get_flag("no_unauth");
    let replace_query = matches.get_one::<String>("replace_query").cloned();
    state.update_settings(|s| {
        if no_unauth {
            s.check_unauthenticated = false;
        }
        if let Some(text) = replace_query {
            s.replace_query_param = true;
            s.replace_query_param_text = text;
        }
    });
    Ok(())
}

async fn run(matches: ArgMatches) -> Result<()> {
    let state = Arc::new(ReplayState::new());

    let store = matches.get_one::<String>("settings").map(SettingsStore::new);
    if let Some(store) = &store {
        store.load(&state)?;
    }
    configure(&state, &matches)?;
    if let Some(store) = &store {
        store.save(&state)?;
        let _autosave = store.clone().spawn_autosave(Arc::clone(&state));
    }
    if let Some(path) = matches.get_one::<String>("export_config") {
        config::save_file(&state, Path::new(path))?;
        println!("Configuration written to {}", path);
    }

    let timeout = matches.get_one::<u64>("timeout").copied().unwrap_or(30);
    let transport = ReqwestTransport::new(&TransportOptions {
        accept_invalid_certs: matches.get_flag("insecure"),
        timeout: Some(Duration::from_secs(timeout)),
    })?;
    let scope = ScopeMatcher::new(strings(&matches, "scope_include"), strings(&matches, "scope_exclude"));
    let log = Arc::new(ResultLog::with_notifier(state.notifier()));
    let workers = matches.get_one::<usize>("workers").copied().unwrap_or(DEFAULT_WORKERS);
    let orchestrator = Orchestrator::with_workers(
        Arc::clone(&state),
        Arc::clone(&log),
        Arc::new(transport),
        Arc::new(scope),
        workers,
    );

    let input = matches.get_one::<String>("input").map(String::as_str).unwrap_or(".");
    let exchanges = load_path(Path::new(input))?;
    println!("Loaded {} exchanges.", exchanges.len());

    state.set_enabled(true);
    let mut dispatched = 0usize;
    for exchange in exchanges {
        if orchestrator.observe(exchange).is_some() {
            dispatched += 1;
        }
    }
    println!("Replaying {} exchanges with {} profiles...", dispatched, state.snapshot().profiles.len());
    orchestrator.wait_idle().await;
    orchestrator.shutdown().await;
    state.set_enabled(false);

    let profiles = state.snapshot().profile_names();
    let entries = log.snapshot();
    for entry in &entries {
        let mut line = format!(
            "#{:<4} {:<7} {}  Unauth: {}",
            entry.sequence,
            entry.method.as_str(),
            entry.url,
            entry.unauth_label()
        );
        for (id, name) in &profiles {
            let label = entry.profile_result(*id).map_or("-", |r| r.label());
            line.push_str(&format!("  {}: {}", name, label));
        }
        println!("{}", line);
    }

    let report_dir = Path::new(matches.get_one::<String>("report_dir").map(String::as_str).unwrap_or("."));
    let json_report = matches.get_flag("json_report");
    let html_report = matches.get_flag("html_report");
    let csv_report = matches.get_flag("csv_report") || (!json_report && !html_report);

    if csv_report {
        let path = export_csv(&entries, &profiles, report_dir)?;
        println!("CSV report written to {}", path);
    }
    if json_report {
        let path = export_json(&entries, &profiles, report_dir)?;
        println!("JSON report written to {}", path);
    }
    if html_report {
        let filter_text = matches.get_one::<String>("report_filter").map(String::as_str).unwrap_or("all");
        let filter = filter_text.parse::<ReportFilter>().unwrap_or_else(|e| {
            warn!("{}; using all statuses", e);
            ReportFilter::All
        });
        let path = export_html(&entries, &profiles, filter, &state.settings(), report_dir)?;
        println!("HTML report written to {}", path);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let logging = LoggingConfig {
        level: matches.get_one::<String>("log_level").cloned().unwrap_or_else(|| "info".to_string()),
        json_format: matches.get_flag("log_json"),
        ..LoggingConfig::default()
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("{}", e);
        std::process::exit(2);
    }

    if let Err(e) = run(matches).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
