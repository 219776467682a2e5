use std::process::ExitCode;
use std::sync::Arc;

use config::AgentConfig;
use containers::{CgroupOverride, Dispatcher, EnvStore, FollowSettings, Followers, SETTLE_DELAY};
use health::{HealthSink, Reporter};
use identity::InstanceIdentity;
use logs::{DeliveryConfig, DeliveryEngine, LineBuffer};
use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
use sinks::{CloudWatchLogs, KinesisStreams, SinkError, sigv4::Credentials};

mod cli;
mod config;
mod containers;
mod health;
mod identity;
mod logs;
mod runtime;
mod signals;
mod sinks;
#[cfg(test)]
mod testing;

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("Container runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Log sink setup: {0}")]
    Sink(#[from] SinkError),
    #[error("Signal handling: {0}")]
    Signals(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::get_cli_args();
    let config = match AgentConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Unable to load config {:?}: {err}", args.config);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    signals::handle_shutdown()?;

    let identity = Arc::new(InstanceIdentity::resolve(&config));
    let config_images = config.agent_images.clone();
    log::info!("Starting agent on instance {}", identity.instance_id);

    let docker = DockerRuntime::connect(config.docker_host.as_deref())?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let buffer = Arc::new(LineBuffer::new());
    let agent_stream = config
        .log_group
        .as_deref()
        .filter(|_| config.mirror_operational)
        .map(|group| Reporter::agent_stream(group, &identity.instance_id));
    let health: Arc<dyn HealthSink> =
        Arc::new(Reporter::new(Arc::clone(&buffer), agent_stream.clone()));

    let credentials = Credentials::from_env();
    let logs = CloudWatchLogs::new(
        &config.logs_endpoint(),
        &config.region,
        config.request_timeout(),
        credentials.clone(),
    )?;
    let streams = KinesisStreams::new(
        &config.kinesis_endpoint(),
        &config.region,
        config.request_timeout(),
        credentials,
    )?;
    let delivery = DeliveryEngine::new(
        DeliveryConfig::new(&config, agent_stream),
        Arc::clone(&buffer),
        Arc::new(logs),
        Arc::new(streams),
        Arc::clone(&health),
    );
    tokio::spawn(delivery.run());

    let followers = Followers::new(
        Arc::clone(&runtime),
        Arc::clone(&buffer),
        Arc::clone(&health),
        FollowSettings::from(&config),
    );
    let cgroups = CgroupOverride::new(&config.cgroup_root, SETTLE_DELAY, Arc::clone(&health));
    let mut dispatcher = Dispatcher::new(
        runtime,
        Arc::new(EnvStore::default()),
        buffer,
        Arc::clone(&health),
        identity,
        followers,
        cgroups,
    );

    dispatcher.reconcile().await?;
    if dispatcher.agent().is_none() {
        log::warn!("No running agent container matched {:?}", config_images);
    }
    signals::notify_ready();

    if let Err(err) = dispatcher.run().await {
        let reason = err.to_string();
        health.mark_unhealthy("docker", &reason).await;
        health.report_crash_dump("docker", &reason).await;
        return Err(err.into());
    }
    Ok(())
}
