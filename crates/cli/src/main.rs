mod http;
mod logging;
mod settings;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use rollcheck_harness::{
    Capability, CapabilityTable, HarnessConfig, HarnessError, HarnessResult, Phase,
    PhaseCoordinator, RunReport, Scenario, ScenarioContext, ServiceClient, ServiceRequest,
    ServiceResponse, ServiceVersion,
};
use rollcheck_scenarios::standard_scenarios;
use serde::Serialize;

use crate::http::HttpServiceClient;
use crate::settings::Settings;

/// Exit code when every selected scenario passed or was skipped.
const EXIT_OK: i32 = 0;
/// Exit code when at least one scenario failed.
const EXIT_FAILED: i32 = 1;
/// Exit code for configuration errors and aborted runs.
const EXIT_ABORTED: i32 = 2;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Full-cluster-restart upgrade compatibility checks.
#[derive(Parser)]
#[command(name = "rollcheck", version, about = "Full-cluster-restart upgrade compatibility checks")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one phase of the upgrade scenarios against a cluster
    Run {
        /// pre-upgrade (old) or post-upgrade (new); defaults to $ROLLCHECK_PHASE
        #[arg(long)]
        phase: Option<Phase>,
        /// Version the cluster ran before the upgrade; defaults to $ROLLCHECK_ORIGIN_VERSION
        #[arg(long)]
        origin_version: Option<ServiceVersion>,
        /// Path to a TOML settings file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Cluster URL, overriding the settings file
        #[arg(long)]
        url: Option<String>,
        /// Only run the named scenario (repeatable)
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
    },

    /// List the scenarios in run order
    Scenarios {
        /// Show whether each scenario applies to this origin version
        #[arg(long)]
        origin_version: Option<ServiceVersion>,
    },

    /// Show the behavior a capability resolves to for a version
    Resolve {
        /// Capability name, e.g. persistent-task-state-field
        capability: Capability,
        /// Service version, e.g. 6.3.2
        version: ServiceVersion,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.quiet);

    let code = match cli.command {
        Commands::Run {
            phase,
            origin_version,
            config,
            url,
            scenarios,
        } => cmd_run(
            RunOptions {
                phase,
                origin_version,
                config: config.as_deref(),
                url: url.as_deref(),
                selected: &scenarios,
            },
            cli.output,
            cli.quiet,
        ),
        Commands::Scenarios { origin_version } => {
            cmd_scenarios(origin_version, cli.output, cli.quiet)
        }
        Commands::Resolve {
            capability,
            version,
        } => cmd_resolve(capability, &version, cli.output, cli.quiet),
    };
    process::exit(code);
}

struct RunOptions<'a> {
    phase: Option<Phase>,
    origin_version: Option<ServiceVersion>,
    config: Option<&'a Path>,
    url: Option<&'a str>,
    selected: &'a [String],
}

fn cmd_run(opts: RunOptions<'_>, output: OutputFormat, quiet: bool) -> i32 {
    let mut settings = match Settings::load(opts.config) {
        Ok(s) => s,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            return EXIT_ABORTED;
        }
    };
    if let Some(url) = opts.url {
        settings.service.url = url.to_string();
    }
    settings.apply_env(|key| std::env::var(key).ok());
    if let Err(e) = settings.validate() {
        report_error(&format!("error: {}", e), output, quiet);
        return EXIT_ABORTED;
    }

    let config = match HarnessConfig::resolve(opts.phase, opts.origin_version) {
        Ok(c) => c,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            return EXIT_ABORTED;
        }
    };

    let mut scenarios = standard_scenarios(&settings.scenario_settings());
    if !opts.selected.is_empty() {
        if let Some(unknown) = opts
            .selected
            .iter()
            .find(|name| !scenarios.iter().any(|s| s.name() == name.as_str()))
        {
            let known: Vec<&str> = scenarios.iter().map(|s| s.name()).collect();
            let msg = format!(
                "error: unknown scenario '{}'. Valid: {}",
                unknown,
                known.join(", ")
            );
            report_error(&msg, output, quiet);
            return EXIT_ABORTED;
        }
        scenarios.retain(|s| opts.selected.iter().any(|name| name.as_str() == s.name()));
    }

    let client = HttpServiceClient::new(&settings.service);
    tracing::info!(url = client.base_url(), "connecting");
    let report = PhaseCoordinator::new(config, &client).run(&scenarios);

    if !quiet {
        print_report(&report, output);
    }
    exit_code(&report)
}

fn exit_code(report: &RunReport) -> i32 {
    if report.aborted.is_some() {
        EXIT_ABORTED
    } else if report.failed > 0 {
        EXIT_FAILED
    } else {
        EXIT_OK
    }
}

fn print_report(report: &RunReport, output: OutputFormat) {
    match output {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
    }
}

/// Stands in for the cluster when only applicability is evaluated.
struct Offline;

impl ServiceClient for Offline {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        Err(HarnessError::unreachable(format!(
            "{}: listing scenarios does not contact the cluster",
            request
        )))
    }
}

#[derive(Serialize)]
struct ScenarioListing {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    applies: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

fn applicability(scenario: &dyn Scenario, ctx: &ScenarioContext<'_>) -> (bool, Option<String>) {
    match scenario.applies_to(ctx) {
        Ok(true) => (true, None),
        Ok(false) => (false, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

fn cmd_scenarios(origin_version: Option<ServiceVersion>, output: OutputFormat, quiet: bool) -> i32 {
    let scenarios = standard_scenarios(&Settings::default().scenario_settings());
    let table = CapabilityTable::standard();
    let config = origin_version.map(|v| HarnessConfig::new(Phase::PreUpgrade, v));
    let ctx = config
        .as_ref()
        .map(|c| ScenarioContext::new(&Offline, c, &table));

    let listing: Vec<ScenarioListing> = scenarios
        .iter()
        .map(|s| {
            let (applies, reason) = match &ctx {
                Some(ctx) => {
                    let (applies, reason) = applicability(s.as_ref(), ctx);
                    (Some(applies), reason)
                }
                None => (None, None),
            };
            ScenarioListing {
                name: s.name().to_string(),
                description: s.description().to_string(),
                applies,
                reason,
            }
        })
        .collect();

    if quiet {
        return EXIT_OK;
    }
    match output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&listing)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => {
            for entry in &listing {
                let marker = match entry.applies {
                    Some(true) => "  [applies]",
                    Some(false) => "  [skipped]",
                    None => "",
                };
                println!("{:<20} {}{}", entry.name, entry.description, marker);
                if let Some(reason) = &entry.reason {
                    println!("{:<20} {}", "", reason);
                }
            }
        }
    }
    EXIT_OK
}

fn cmd_resolve(capability: Capability, version: &ServiceVersion, output: OutputFormat, quiet: bool) -> i32 {
    let table = CapabilityTable::standard();
    let entry = match table.resolve_entry(capability, version) {
        Ok(entry) => entry,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            return EXIT_FAILED;
        }
    };

    if !quiet {
        match output {
            OutputFormat::Json => {
                let value = serde_json::json!({
                    "capability": capability,
                    "version": version,
                    "since": entry.since,
                    "descriptor": entry.descriptor,
                });
                let json = serde_json::to_string_pretty(&value)
                    .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
                println!("{}", json);
            }
            OutputFormat::Text => {
                println!("{} on {}: {} (since {})", capability, version, entry.descriptor, entry.since);
            }
        }
    }
    EXIT_OK
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => eprintln!("{}", serde_json::json!({ "error": msg })),
    }
}
