use std::sync::Arc;

use serde_json::{Value, json};
use tether::{TetherConfig, procedures};
use tether_rpc::link::{SocketServer, SocketTransport};
use tether_rpc::{ClientError, ErrorCode, RpcClient};

fn config(name: &str) -> TetherConfig {
    let mut config = TetherConfig::default();
    config.rpc.socket_path =
        std::env::temp_dir().join(format!("tether-serve-{}-{name}.sock", std::process::id()));
    config
}

async fn client(config: &TetherConfig) -> anyhow::Result<RpcClient> {
    let transport = SocketTransport::connect(&config.rpc.socket_path, config.codec()).await?;
    Ok(RpcClient::with_reconnect(
        transport,
        config.rpc.reconnect.clone(),
    ))
}

#[tokio::test]
async fn test_builtin_procedures_over_socket() -> anyhow::Result<()> {
    tether::setup(None);
    let config = config("builtin");
    let server = SocketServer::bind(&config.rpc.socket_path, config.codec())?
        .serve(Arc::new(procedures::registry()?), ());
    let client = client(&config).await?;

    assert_eq!(
        client.query("echo", json!({"hello": [1, 2]})).await?,
        json!({"hello": [1, 2]})
    );
    let time = client.query("time", Value::Null).await?;
    assert!(time.is_string());

    let mut ticks = client.subscribe("ticks", json!({"count": 3, "interval_ms": 1}))?;
    let mut seen = Vec::new();
    while let Some(tick) = ticks.next().await {
        seen.push(tick?["n"].clone());
    }
    assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);

    client.close();
    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_unknown_and_mismatched_procedures() -> anyhow::Result<()> {
    let config = config("errors");
    let server = SocketServer::bind(&config.rpc.socket_path, config.codec())?
        .serve(Arc::new(procedures::registry()?), ());
    let client = client(&config).await?;

    let err = client
        .query("nope", Value::Null)
        .await
        .expect_err("unknown path");
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    // `echo` is a query, not a mutation
    let err = client
        .mutation("echo", Value::Null)
        .await
        .expect_err("kind mismatch");
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    client.close();
    assert!(matches!(
        client.query("echo", Value::Null).await,
        Err(ClientError::Closed)
    ));

    server.abort();
    Ok(())
}
