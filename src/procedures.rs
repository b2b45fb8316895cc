//! Procedures served by `tether serve`

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tether_rpc::RpcError;
use tether_rpc::server::{EventStream, ProcedureOutput, Registry, RegistryError};

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct TicksInput {
    /// Stop after this many ticks; unbounded when absent
    count: Option<u64>,
    interval_ms: Option<u64>,
}

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

async fn ticks(input: Value) -> Result<ProcedureOutput, RpcError> {
    let input: TicksInput = if input.is_null() {
        TicksInput::default()
    } else {
        serde_json::from_value(input)
            .map_err(|e| RpcError::bad_request("Invalid ticks input").with_cause(e))?
    };
    let interval = input
        .interval_ms
        .map_or(DEFAULT_TICK_INTERVAL, Duration::from_millis);

    let (emitter, stream) = EventStream::channel(16);
    tokio::spawn(async move {
        let mut n = 0;
        while input.count.is_none_or(|count| n < count) {
            let tick = json!({"n": n, "at": chrono::Local::now().to_rfc3339()});
            if emitter.next(tick).await.is_err() {
                log::debug!("Ticks subscriber went away after {n} tick(s)");
                return;
            }
            n += 1;
            tokio::time::sleep(interval).await;
        }
        emitter.complete().await;
    });

    Ok(stream.into())
}

/// `echo` (query), `time` (query) and `ticks` (subscription)
pub fn registry() -> Result<Registry<()>, RegistryError> {
    Registry::builder()
        .query("echo", |input, ()| async move { Ok(input) })
        .query("time", |_, ()| async {
            Ok(Value::String(chrono::Local::now().to_rfc3339()))
        })
        .subscription("ticks", |input, ()| ticks(input))
        .build()
}
