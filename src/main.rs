// ABOUTME: Entry point for the stevedore CLI application.
// ABOUTME: Parses arguments, wires up executors and deployers, and dispatches commands.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConnectionArgs};
use nonempty::NonEmpty;
use std::env;
use std::sync::Arc;
use stevedore::compose::{ComposeConfig, RegistryConfig};
use stevedore::deploy::{Deployer, DeploymentCoordinator};
use stevedore::error::{Error, Result};
use stevedore::exec::{Executor, LocalExecutor, SshConfig, SshExecutor};
use stevedore::state::{StateManager, VersionTag};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("stevedore=info".parse().expect("valid directive"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Deploy { connection, tag } => {
            let local: Arc<dyn Executor> = Arc::new(LocalExecutor::new());
            let tag = resolve_tag(local.as_ref(), tag).await?;
            let coordinator = build_coordinator(&connection, local).await?;
            let config = ComposeConfig::load(&connection.file)?;

            println!(
                "Deploying {} ({} services) to {} host(s)",
                tag,
                config.services.len(),
                connection.hosts.len()
            );
            coordinator.deploy_compose(&config, &tag).await?;
            println!("Deployment complete!");
            Ok(())
        }
        Commands::Rollback {
            connection,
            service,
        } => {
            let local: Arc<dyn Executor> = Arc::new(LocalExecutor::new());
            let coordinator = build_coordinator(&connection, local).await?;

            match service {
                Some(name) => {
                    println!("Rolling back {} on {} host(s)", name, connection.hosts.len());
                    coordinator.rollback_service(&name).await?;
                }
                None => {
                    println!("Rolling back {} host(s)", connection.hosts.len());
                    coordinator.rollback().await?;
                }
            }
            println!("Rollback complete!");
            Ok(())
        }
        Commands::Status { connection, json } => {
            let hosts = nonempty_hosts(&connection)?;
            for host in &hosts {
                let remote = connect_host(&connection, host).await?;
                let state =
                    StateManager::new(remote, connection.remote_dir.clone())
                        .load()
                        .await
                        .map_err(Error::State)?;

                println!("# {}", host);
                if json {
                    println!("{}", serde_json::to_string_pretty(&state).map_err(|e| {
                        Error::InvalidConfig(format!("failed to render state: {e}"))
                    })?);
                } else {
                    print!("{}", serde_yaml::to_string(&state)?);
                }
            }
            Ok(())
        }
    }
}

fn nonempty_hosts(connection: &ConnectionArgs) -> Result<NonEmpty<String>> {
    NonEmpty::from_vec(connection.hosts.clone()).ok_or(Error::NoHosts)
}

/// Resolve the version tag to deploy: an explicit flag, or the local
/// checkout's current revision.
async fn resolve_tag(local: &dyn Executor, explicit: Option<String>) -> Result<VersionTag> {
    let raw = match explicit {
        Some(tag) => tag,
        None => {
            let output = local.exec_checked("git rev-parse --short HEAD").await?;
            output.stdout.trim().to_string()
        }
    };
    VersionTag::parse(&raw).map_err(|e| Error::InvalidTag(e.to_string()))
}

fn registry_config(connection: &ConnectionArgs) -> Result<Option<RegistryConfig>> {
    let Some(registry) = &connection.registry else {
        return Ok(None);
    };
    let username = env::var("REGISTRY_USERNAME")
        .map_err(|_| Error::MissingEnvVar("REGISTRY_USERNAME".to_string()))?;
    let password = env::var("REGISTRY_PASSWORD")
        .map_err(|_| Error::MissingEnvVar("REGISTRY_PASSWORD".to_string()))?;
    Ok(Some(RegistryConfig {
        registry: registry.clone(),
        username,
        password,
    }))
}

async fn connect_host(connection: &ConnectionArgs, host: &str) -> Result<Arc<dyn Executor>> {
    let mut ssh_config = SshConfig::new(host, &connection.ssh_user)
        .port(connection.ssh_port)
        .trust_on_first_use(connection.trust_host);

    if let Some(path) = &connection.identity_file {
        ssh_config = ssh_config.key_path(path.clone());
    } else if let Ok(path) = env::var("STEVEDORE_SSH_KEY") {
        ssh_config = ssh_config.key_path(path);
    }

    let executor = SshExecutor::connect(ssh_config).await?;
    Ok(Arc::new(executor))
}

async fn build_coordinator(
    connection: &ConnectionArgs,
    local: Arc<dyn Executor>,
) -> Result<DeploymentCoordinator> {
    let hosts = nonempty_hosts(connection)?;
    let config = ComposeConfig::load(&connection.file)?;
    let registry = registry_config(connection)?;

    let mut deployers = Vec::new();
    for host in &hosts {
        println!("  → Connecting to {}...", host);
        let remote = connect_host(connection, host).await?;

        let options = stevedore::deploy::DeployerOptions {
            remote_work_dir: connection.remote_dir.clone(),
            proxy_dynamic_dir: connection.proxy_dir.clone(),
            registry: registry.clone(),
            ..Default::default()
        };

        let deployer = Deployer::connect(
            host.clone(),
            local.clone(),
            remote,
            config.clone(),
            connection.file.clone(),
            options,
        )
        .await?;
        deployers.push(deployer);
    }

    Ok(DeploymentCoordinator::new(deployers))
}
