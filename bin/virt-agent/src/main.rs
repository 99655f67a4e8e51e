// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{ConfigDropshot, HandlerTaskMode};
use slog::{debug, info, o, Logger};
use virt_agent::dispatch::Dispatcher;
use virt_agent::exec::ProcessRunner;
use virt_agent::handlers::{self, Services};
use virt_agent::probe::hypervisor::VirshHypervisor;
use virt_agent::probe::SystemProbe;
use virt_agent::provision::ScriptProvisioner;
use virt_agent::server;
use virt_agent_config::Config;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version, disable_help_flag = true)]
/// An HTTP agent reporting virtualization host resources and creating guests
struct Args {
    /// Host name or address to listen on
    #[clap(short = 'h', long, default_value = "localhost")]
    hostname: String,

    /// TCP port to listen on
    #[clap(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to a TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Logging level for the agent
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    /// Print help
    #[clap(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("virt-agent", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        slog::o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

/// Resolves the listen address, preferring the first address the resolver
/// returns.
async fn resolve_bind_address(
    hostname: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((hostname, port))
        .await
        .with_context(|| format!("cannot resolve {hostname}"))?
        .next()
        .ok_or_else(|| anyhow!("{hostname} did not resolve to any address"))
}

fn build_dispatcher(
    config: &Config,
    log: &Logger,
) -> anyhow::Result<Dispatcher> {
    let runner = Arc::new(ProcessRunner);
    let hypervisor = Arc::new(VirshHypervisor::new(
        config.hypervisor.virsh.clone(),
        config.hypervisor.uri.clone(),
        runner.clone(),
    ));
    let probe = Arc::new(SystemProbe::new(
        hypervisor,
        runner,
        log.new(o!("component" => "probe")),
    ));
    let services = Services::new(config, probe, Arc::new(ScriptProvisioner));

    let routes = handlers::routes().context("building route table")?;
    for (method, pattern) in routes.patterns() {
        debug!(log, "registered route";
            "method" => %method, "pattern" => %pattern);
    }
    Ok(Dispatcher::new(
        routes,
        services,
        log.new(o!("component" => "dispatch")),
    ))
}

async fn run_server(
    config_dropshot: ConfigDropshot,
    dispatcher: Dispatcher,
    log: Logger,
) -> anyhow::Result<()> {
    info!(log, "Starting server...";
        "address" => %config_dropshot.bind_address);

    let server = server::start(&config_dropshot, dispatcher, &log)
        .map_err(|error| anyhow!("Failed to start server: {}", error))?;

    server.await.map_err(|e| anyhow!("Server exited with an error: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Command line arguments.
    let args = Args::parse();

    let log = build_logger(args.log_level);

    let config = match &args.config {
        Some(path) => virt_agent_config::parse(path).with_context(|| {
            format!("failed to load config {}", path.display())
        })?,
        None => Config::default(),
    };

    let bind_address = resolve_bind_address(&args.hostname, args.port).await?;

    // Dropshot configuration.
    let config_dropshot = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: config
            .provision
            .request_body_max_bytes,
        default_handler_task_mode: HandlerTaskMode::Detached,
        ..Default::default()
    };

    let dispatcher = build_dispatcher(&config, &log)?;

    run_server(config_dropshot, dispatcher, log).await
}
