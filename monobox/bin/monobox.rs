use std::{sync::Arc, time::Duration};

use clap::{CommandFactory, Parser};
use monobox::{
    cli::{MonoboxArgs, MonoboxSubcommand},
    config::ControllerConfig,
    ops::{CreateSandbox, SandboxOps},
    reconcile::Dispatcher,
    store::KubeStore,
    MonoboxError, MonoboxResult,
};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MonoboxResult<()> {
    // Initialize tracing subscriber with EnvFilter
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = MonoboxArgs::parse();
    let mut config = ControllerConfig::from_env();
    if let Some(namespace) = args.namespace {
        config = config.with_namespace(namespace);
    }

    match args.subcommand {
        Some(MonoboxSubcommand::Run { sync_interval }) => {
            if let Some(secs) = sync_interval {
                config = config.with_sync_interval(Duration::from_secs(secs));
            }
            run_controller(config).await?;
        }
        Some(MonoboxSubcommand::Create {
            name,
            image,
            ttl,
            volume,
            template,
            wait,
        }) => {
            let (ops, namespace) = client_ops(config).await?;
            let request = CreateSandbox {
                name,
                image,
                ttl_minutes: ttl,
                volume,
                resources: None,
                template,
            };
            let mut created = ops.create(&namespace, request).await?;
            if wait {
                created = ops.wait_until_ready(&namespace, &created.name).await?;
            }
            print_json(&created)?;
        }
        Some(MonoboxSubcommand::Get { name }) => {
            let (ops, namespace) = client_ops(config).await?;
            print_json(&ops.get(&namespace, &name).await?)?;
        }
        Some(MonoboxSubcommand::List) => {
            let (ops, namespace) = client_ops(config).await?;
            print_json(&ops.list(&namespace).await?)?;
        }
        Some(MonoboxSubcommand::Delete { name }) => {
            let (ops, namespace) = client_ops(config).await?;
            if ops.delete(&namespace, &name).await? {
                println!("sandbox {name} deleted");
            } else {
                println!("sandbox {name} not found");
            }
        }
        Some(MonoboxSubcommand::Claim { pool, volume }) => {
            let (ops, namespace) = client_ops(config).await?;
            print_json(&ops.claim(&namespace, &pool, volume.as_deref()).await?)?;
        }
        Some(MonoboxSubcommand::Exec {
            name,
            command,
            workdir,
        }) => {
            let (ops, namespace) = client_ops(config).await?;
            let outcome = ops
                .execute(&namespace, &name, &command, workdir.as_deref())
                .await?;
            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
            if !outcome.success() {
                std::process::exit(outcome.exit_code);
            }
        }
        Some(MonoboxSubcommand::Upload { name, source, dest }) => {
            let (ops, namespace) = client_ops(config).await?;
            let content = tokio::fs::read_to_string(&source).await?;
            let dest = match dest {
                Some(dest) => dest,
                None => source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| MonoboxError::InvalidPath(source.display().to_string()))?,
            };
            ops.upload_file(&namespace, &name, &dest, &content).await?;
            println!("uploaded {} to {dest}", source.display());
        }
        Some(MonoboxSubcommand::Download { name, source, dest }) => {
            let (ops, namespace) = client_ops(config).await?;
            let content = ops.download_file(&namespace, &name, &source).await?;
            match dest {
                Some(dest) => {
                    tokio::fs::write(&dest, content).await?;
                    println!("downloaded {source} to {}", dest.display());
                }
                None => print!("{content}"),
            }
        }
        Some(MonoboxSubcommand::Logs { name, tail }) => {
            let (ops, namespace) = client_ops(config).await?;
            print!("{}", ops.logs(&namespace, &name, tail).await?);
        }
        None => {
            MonoboxArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

/// Runs the reconcile loops in the foreground until SIGTERM or SIGINT.
async fn run_controller(config: ControllerConfig) -> MonoboxResult<()> {
    let store = Arc::new(KubeStore::try_default().await?);
    let dispatcher = Arc::new(Dispatcher::new(store, config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM signal");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT signal");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await
}

/// Builds the consumer facade against the cluster the environment points at.
async fn client_ops(
    config: ControllerConfig,
) -> MonoboxResult<(SandboxOps<KubeStore, KubeStore>, String)> {
    let namespace = config.get_namespace().clone();
    let store = Arc::new(KubeStore::try_default().await?);
    let ops = SandboxOps::new(store.clone(), store, config);
    Ok((ops, namespace))
}

fn print_json<T: serde::Serialize>(value: &T) -> MonoboxResult<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(MonoboxError::custom)?;
    println!("{rendered}");
    Ok(())
}
