use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rdfm_client::daemon::{build_device, load_certificate, shutdown_on_signal};
use rdfm_client::mcumgr::{McumgrAgent, McumgrConfig};
use rdfm_client::{Config, Daemon};

/// RDFM device client
#[derive(Parser)]
#[command(name = "rdfm", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install an artifact from a local file or a URL
    Install {
        /// Path or http(s) URL of the artifact
        artifact: String,
    },
    /// Keep the installed update
    Commit,
    /// Return to the previous image
    Rollback,
    /// Print the installed artifact name
    ShowArtifact,
    /// Print the installed provides
    ShowProvides,
    /// Run the device agent
    Daemonize,
    /// Run the MCUmgr agent for microcontroller devices
    Mcumgr {
        /// Agent configuration file
        #[arg(short, long, env = "RDFM_MCUMGR_CONFIG", default_value = "/etc/rdfm/mcumgr.yaml")]
        config: PathBuf,

        /// Override the configured retry count (0 = retry forever)
        #[arg(short, long)]
        retries: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,rdfm_client=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Install { artifact } => install(artifact).await,
        Command::Commit => {
            let device = build_device(&Config::load()?)?;
            device.commit()?;
            tracing::info!("update committed");
            Ok(())
        }
        Command::Rollback => {
            let device = build_device(&Config::load()?)?;
            device.rollback()?;
            tracing::info!("update rolled back");
            Ok(())
        }
        Command::ShowArtifact => {
            let device = build_device(&Config::load()?)?;
            println!("{}", device.artifact_name()?);
            Ok(())
        }
        Command::ShowProvides => {
            let device = build_device(&Config::load()?)?;
            for (key, value) in device.provides()? {
                println!("{key}={value}");
            }
            Ok(())
        }
        Command::Daemonize => daemonize().await,
        Command::Mcumgr { config, retries } => mcumgr(config, retries).await,
    }
}

fn open_artifact(source: &str, certificate: Option<Vec<u8>>) -> anyhow::Result<Box<dyn Read + Send>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(pem) = certificate {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let response = builder.build()?.get(source).send()?.error_for_status()?;
        Ok(Box::new(response))
    } else {
        let file = File::open(source).with_context(|| format!("cannot open artifact {source}"))?;
        Ok(Box::new(file))
    }
}

async fn install(source: String) -> anyhow::Result<()> {
    let config = Config::load()?;
    let device = build_device(&config)?;
    let certificate = load_certificate(&config)?;

    let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let artifact = open_artifact(&source, certificate)?;
        Ok(device.install(artifact)?)
    })
    .await??;

    tracing::info!(artifact = %outcome.artifact_name, "artifact installed");
    if outcome.committed {
        tracing::info!("nothing to reboot into, update committed");
    } else if outcome.reboot_required {
        tracing::info!("reboot the device, then run `rdfm commit` or `rdfm rollback`");
    } else {
        tracing::info!("run `rdfm commit` or `rdfm rollback` to finish the update");
    }
    Ok(())
}

async fn daemonize() -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");
    if config.server_url.is_empty() {
        anyhow::bail!("ServerURL is not configured");
    }

    let daemon = Daemon::new(config)?;
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));
    daemon.run(cancel).await?;
    Ok(())
}

async fn mcumgr(path: PathBuf, retries: Option<u32>) -> anyhow::Result<()> {
    let mut config = McumgrConfig::load(&path)?;
    if let Some(retries) = retries {
        config.retries = retries;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));
    McumgrAgent::new(config).run(&cancel).await?;
    Ok(())
}
