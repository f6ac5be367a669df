use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use puppetdb_sd::config::Config;
use puppetdb_sd::outputs;
use puppetdb_sd::poll::Poller;
use puppetdb_sd::{get_version, puppetdb};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
#[argh(
    description = "Generate Prometheus scrape configs from PuppetDB",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level, overridden by PUPPETDB_SD_LOG"
    )]
    log_level: String,

    #[argh(
        option,
        short = 'c',
        description = "read configuration from the YAML file, defaults are used if not set"
    )]
    config: Option<PathBuf>,

    #[argh(switch, description = "poll PuppetDB once and exit")]
    once: bool,
}

fn init_tracing(color: bool, levels: &str) {
    let (filter, invalid) = match EnvFilter::try_new(levels) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new("info"), Some(err)),
    };

    // stdout is reserved for the stdout output
    tracing_subscriber::fmt()
        .with_ansi(color)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(err) = invalid {
        warn!(message = "invalid log level, fallback to info", levels, %err);
    }
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("puppetdb-sd {}", get_version());
    }

    fn load_config(&self) -> Result<Config, ExitCode> {
        let result = match &self.config {
            Some(path) => Config::load(path),
            None => {
                let config = Config::default();
                config.validate().map(|_| config)
            }
        };

        result.map_err(|err| {
            error!(message = "load configuration failed", %err);
            exitcode::CONFIG
        })
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let log_level = std::env::var("PUPPETDB_SD_LOG").unwrap_or_else(|_| {
            match self.log_level.as_str() {
                "off" => "off".to_string(),
                level => format!("puppetdb_sd={level},kubernetes={level}"),
            }
        });
        let color = std::io::stderr().is_terminal();
        init_tracing(color, &log_level);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("puppetdb-sd-worker")
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(async move {
            let config = self.load_config()?;

            info!(
                message = "start puppetdb-sd",
                version = get_version(),
                config = ?self.config,
                url = config.puppetdb.url,
                method = ?config.output.method,
                format = ?config.output.format,
                interval = ?config.interval,
            );

            let client = puppetdb::Client::new(&config.puppetdb).map_err(|err| {
                error!(message = "create puppetdb client failed", %err);
                exitcode::CONFIG
            })?;

            let output = outputs::build(&config.output).await.map_err(|err| {
                error!(message = "build output failed", %err);
                exitcode::CONFIG
            })?;

            let mut poller = Poller::new(client, config.proxy_url, output, config.interval);
            if self.once {
                return poller.poll().await.map_err(|err| {
                    error!(message = "poll failed", %err);
                    exitcode::UNAVAILABLE
                });
            }

            let mut sigint = signal(SignalKind::interrupt()).map_err(|err| {
                error!(message = "set up SIGINT handler failed", %err);
                exitcode::OSERR
            })?;
            let mut sigterm = signal(SignalKind::terminate()).map_err(|err| {
                error!(message = "set up SIGTERM handler failed", %err);
                exitcode::OSERR
            })?;
            let shutdown = async move {
                tokio::select! {
                    _ = sigint.recv() => info!(message = "SIGINT received, shutting down"),
                    _ = sigterm.recv() => info!(message = "SIGTERM received, shutting down"),
                }
            };

            poller.run(shutdown).await;

            Ok::<(), ExitCode>(())
        })?;

        runtime.shutdown_timeout(Duration::from_secs(5));

        Ok(())
    }
}
