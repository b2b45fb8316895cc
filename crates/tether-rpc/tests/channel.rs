use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tether_rpc::client::{ChannelObserver, Operation, ReconnectConfig, RpcClient};
use tether_rpc::link::ChannelTransport;
use tether_rpc::server::{self, EventStream, Registry};
use tether_rpc::{ErrorCode, ProcedureKind, RpcError, Transport, TransportEvent};

/// Test output honours `RUST_LOG`, e.g. `RUST_LOG=tether_rpc=trace`
fn init_logger() {
    if env_logger::builder().is_test(true).try_init().is_err() {
        log::trace!("Logger already initialised");
    }
}

fn registry() -> Arc<Registry<()>> {
    init_logger();
    let registry = Registry::builder()
        .query("echo", |input, ()| async move { Ok(input) })
        .mutation("reject", |_, ()| async {
            Err(RpcError::bad_request("rejected"))
        })
        .subscription("ticks", |_, ()| async {
            let (emitter, stream) = EventStream::channel(8);
            tokio::spawn(async move {
                let mut n = 0;
                while emitter.next(json!(n)).await.is_ok() {
                    n += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            Ok(stream.into())
        })
        .subscription("finite", |_, ()| async {
            Ok(EventStream::from_values([json!("a"), json!("b")]).into())
        })
        .build()
        .expect("Failed to build registry");
    Arc::new(registry)
}

#[tokio::test]
async fn test_echo_round_trip() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    assert_eq!(client.query("echo", json!("hi")).await?, json!("hi"));
    assert_eq!(client.pending_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_share_one_batch() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let mut wire = server_end.subscribe();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    let (a, b) = tokio::join!(
        client.query("echo", json!(1)),
        client.query("echo", json!(2))
    );
    assert_eq!(a?, json!(1));
    assert_eq!(b?, json!(2));

    match wire.recv().await {
        Some(TransportEvent::Message(Value::Array(batch))) => assert_eq!(batch.len(), 2),
        other => panic!("Expected one batch, got {other:?}"),
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_turn_requests_share_one_send_on_multi_thread_runtime() -> anyhow::Result<()> {
    init_logger();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            for round in 0..200 {
                let (client_end, server_end) = ChannelTransport::pair();
                let mut wire = server_end.subscribe();
                let client = RpcClient::new(client_end);

                let (first, _first_events) = ChannelObserver::new();
                let (second, _second_events) = ChannelObserver::new();
                client.request(
                    Operation::new(1_i64, ProcedureKind::Query, "echo", json!(1)),
                    first,
                )?;
                client.request(
                    Operation::new(2_i64, ProcedureKind::Query, "echo", json!(2)),
                    second,
                )?;
                tokio::time::sleep(Duration::from_millis(2)).await;

                let mut sends = Vec::new();
                while let Ok(event) = wire.try_recv() {
                    if let TransportEvent::Message(message) = event {
                        sends.push(message);
                    }
                }
                assert_eq!(sends.len(), 1, "round {round} split the turn: {sends:?}");
                assert_eq!(sends[0].as_array().map(Vec::len), Some(2));
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
}

#[tokio::test]
async fn test_procedure_error_reaches_caller() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    let err = client
        .mutation("reject", json!({"x": 1}))
        .await
        .expect_err("mutation should fail");
    assert_eq!(err.code(), Some(ErrorCode::BadRequest));

    let err = client
        .query("missing", json!(null))
        .await
        .expect_err("query should fail");
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    Ok(())
}

#[tokio::test]
async fn test_finite_subscription_ends_with_stopped() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    let mut subscription = client.subscribe("finite", json!(null))?;
    assert_eq!(subscription.next().await.transpose()?, Some(json!("a")));
    assert_eq!(subscription.next().await.transpose()?, Some(json!("b")));
    assert!(subscription.next().await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_dropping_subscription_stops_it_on_the_server() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let mut wire = client_end.subscribe();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    let mut subscription = client.subscribe("ticks", json!(null))?;
    assert_eq!(subscription.next().await.transpose()?, Some(json!(0)));
    drop(subscription);

    let stopped = json!({"id": 1, "result": {"type": "stopped"}});
    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = wire.recv() => {
                if event == Some(TransportEvent::Message(stopped.clone())) {
                    break;
                }
            }
            () = &mut deadline => panic!("No stopped response"),
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_subscription_resumes_after_reconnect() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let _server = server::attach(registry(), server_end.clone(), ());
    let config = ReconnectConfig {
        min_interval_ms: 10,
        max_interval_ms: 50,
        ..ReconnectConfig::default()
    };
    let client = RpcClient::with_reconnect(client_end, config);

    let mut subscription = client.subscribe("ticks", json!(null))?;
    assert_eq!(subscription.next().await.transpose()?, Some(json!(0)));

    server_end.close();

    // the stream restarts from zero on the fresh server-side subscription
    let mut resumed = false;
    for _ in 0..50 {
        if subscription.next().await.transpose()? == Some(json!(0)) {
            resumed = true;
            break;
        }
    }
    assert!(resumed);
    assert!(server_end.is_connected());

    Ok(())
}

#[tokio::test]
async fn test_close_rejects_new_requests() -> anyhow::Result<()> {
    let (client_end, server_end) = ChannelTransport::pair();
    let _server = server::attach(registry(), server_end, ());
    let client = RpcClient::new(client_end);

    let mut subscription = client.subscribe("ticks", json!(null))?;
    client.close();

    assert!(subscription.next().await.is_none());
    assert!(client.query("echo", json!(1)).await.is_err());

    Ok(())
}
