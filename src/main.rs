use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde_json::Value;
use tether::{TetherConfig, procedures};
use tether_rpc::RpcClient;
use tether_rpc::link::{SocketServer, SocketTransport};
use tether_sandbox::{CommandEngine, Executor};

fn path_arg() -> Arg {
    Arg::new("path").required(true).help("Procedure path")
}

fn input_arg() -> Arg {
    Arg::new("input").help("JSON input; anything else is sent as a string")
}

fn cli() -> Command {
    Command::new("tether")
        .version(env!("CARGO_PKG_VERSION"))
        .about("RPC runtime and sandbox bridge")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to a TOML config file"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("Set verbose output level"),
        )
        .subcommand(Command::new("serve").about("Serve the built-in procedures on the Unix socket"))
        .subcommand(
            Command::new("call")
                .about("Run a query or mutation and print its result")
                .arg(path_arg())
                .arg(input_arg())
                .arg(
                    Arg::new("mutation")
                        .long("mutation")
                        .short('m')
                        .action(ArgAction::SetTrue)
                        .help("Send a mutation instead of a query"),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Subscribe and print every event")
                .arg(path_arg())
                .arg(input_arg())
                .arg(
                    Arg::new("count")
                        .long("count")
                        .short('n')
                        .value_parser(value_parser!(usize))
                        .help("Stop after this many events"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a command script in the sandbox")
                .arg(
                    Arg::new("script")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("config-check").about("Check configuration and exit"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let log_level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    tether::setup(Some(log_level));

    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let config = TetherConfig::resolve(config_path)?;

    match matches.subcommand() {
        Some(("serve", _)) => serve(&config).await,
        Some(("call", args)) => call(&config, args).await,
        Some(("watch", args)) => watch(&config, args).await,
        Some(("run", args)) => run_script(&config, args).await,
        Some(("config-check", _)) => config_check(&config),
        other => Err(anyhow!("Unknown command: {other:?}")),
    }
}

fn parse_input(args: &ArgMatches) -> Value {
    match args.get_one::<String>("input") {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        None => Value::Null,
    }
}

fn procedure_path(args: &ArgMatches) -> Result<&str> {
    args.get_one::<String>("path")
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing procedure path"))
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}

async fn serve(config: &TetherConfig) -> Result<()> {
    log::info!("Starting tether server...");

    let registry = Arc::new(procedures::registry()?);
    let server = SocketServer::bind(&config.rpc.socket_path, config.codec())?;
    let handle = server.serve(registry, ());

    wait_for_shutdown().await?;
    handle.abort();
    // let the accept loop drop the listener and its socket file
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            log::warn!("Server task failed: {e}");
        }
    }

    log::info!("tether server stopped");
    Ok(())
}

async fn connect(config: &TetherConfig) -> Result<RpcClient> {
    let path = &config.rpc.socket_path;
    let transport = SocketTransport::connect(path, config.codec())
        .await
        .with_context(|| format!("Failed to connect to {}", path.display()))?;
    Ok(RpcClient::with_reconnect(
        transport,
        config.rpc.reconnect.clone(),
    ))
}

async fn call(config: &TetherConfig, args: &ArgMatches) -> Result<()> {
    let path = procedure_path(args)?;
    let input = parse_input(args);
    let client = connect(config).await?;

    let result = if args.get_flag("mutation") {
        client.mutation(path, input).await
    } else {
        client.query(path, input).await
    };
    client.close();

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn watch(config: &TetherConfig, args: &ArgMatches) -> Result<()> {
    let path = procedure_path(args)?;
    let input = parse_input(args);
    let limit = args.get_one::<usize>("count").copied();
    let client = connect(config).await?;

    let mut subscription = client.subscribe(path, input)?;
    let mut seen = 0;
    while limit.is_none_or(|limit| seen < limit) {
        tokio::select! {
            event = subscription.next() => match event {
                Some(Ok(value)) => {
                    println!("{value}");
                    seen += 1;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    log::info!("Subscription to {path} ended");
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    subscription.cancel();
    client.close();
    Ok(())
}

async fn run_script(config: &TetherConfig, args: &ArgMatches) -> Result<()> {
    let script = args
        .get_one::<PathBuf>("script")
        .ok_or_else(|| anyhow!("Missing script path"))?;
    let code = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read {}", script.display()))?;
    let filename = script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_owned());

    let executor = Executor::builder()
        .config(config.sandbox.clone())
        .engine(|| CommandEngine)
        .prop("script", filename.clone())
        .add_sync_fn("time", |_| async {
            Ok(Value::String(chrono::Local::now().to_rfc3339()))
        })
        .add_async_fn("echo", |params| async move { Ok(params) })
        .add_async_fn("sleep", |params: Value| async move {
            let ms = params.get(0).and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::Null)
        })
        .add_async_fn("log", |params: Value| async move {
            if let Some(line) = params.get(0).and_then(Value::as_str) {
                print!("{line}");
            }
            Ok(Value::Null)
        })
        .build()?;

    let result = executor.execute(code, filename).await;
    executor.shutdown();
    result?;
    Ok(())
}

fn config_check(config: &TetherConfig) -> Result<()> {
    log::info!("Checking configuration...");
    config.validate()?;

    let socket_dir = config
        .rpc
        .socket_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if !socket_dir.is_dir() {
        return Err(anyhow!(
            "Socket directory {} does not exist",
            socket_dir.display()
        ));
    }
    log::debug!("Socket directory: OK");

    let registry = procedures::registry()?;
    log::debug!("{} built-in procedure(s): OK", registry.len());

    log::debug!(
        "Effective configuration:\n{}",
        toml::to_string_pretty(config)?
    );
    log::info!("Configuration check completed successfully");
    Ok(())
}
