//! Simple example in which the "remote peer" is an in-process calculator with methods `add` and
//! `div`.  Calls made back to back go out as one batch, which the transport prints as it receives.
//!
//! Optionally takes the debounce period as an argument, like `cargo run --example batching 50ms`.
use std::time::Duration;

use anyhow::Context;
use rpcbatch_jsonrpc::{Client, ErrorCode, Payload, Request, Response, StandardErrorMapper, transport_fn};
use serde_json::json;

/// Answer one request the way a tiny calculator service would
fn calculate(request: Request) -> Response {
    let operands = request
        .params
        .as_ref()
        .and_then(|params| params.as_array())
        .map(|params| params.iter().filter_map(|p| p.as_f64()).collect::<Vec<_>>())
        .unwrap_or_default();

    match (request.method.as_str(), operands.as_slice()) {
        ("add", operands) => Response::success(request.id, json!(operands.iter().sum::<f64>())),
        ("div", [_, divisor]) if *divisor == 0.0 => {
            Response::error(request.id, ErrorCode::ServerError(-32000), "division by zero", None)
        }
        ("div", [dividend, divisor]) => Response::success(request.id, json!(dividend / divisor)),
        ("div", _) => Response::error(request.id, ErrorCode::InvalidParams, "div takes two operands", None),
        _ => Response::error(request.id, ErrorCode::MethodNotFound, "Method not found", None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let debounce = match std::env::args().nth(1) {
        Some(arg) => humantime::parse_duration(&arg).with_context(|| format!("Invalid debounce '{arg}'"))?,
        None => Duration::from_millis(1),
    };

    let transport = transport_fn(|payload: Payload<Request>, _cancel| async move {
        println!("-> {}", serde_json::to_string(&payload).unwrap_or_default());
        let reply = match payload {
            Payload::Single(request) => Payload::Single(calculate(request)),
            Payload::Batch(requests) => Payload::Batch(requests.into_iter().map(calculate).collect()),
        };
        println!("<- {}", serde_json::to_string(&reply).unwrap_or_default());
        Ok::<_, std::io::Error>(reply)
    });

    let client = Client::builder()
        .with_debounce(debounce)
        .with_default_error_mapper(StandardErrorMapper)
        .bind(transport);

    // These three are sent together
    let sum = client.call::<_, f64>("add", [1, 2, 3]);
    let quotient = client.call::<_, f64>("div", [10, 4]);
    let oops = client.call::<_, f64>("div", [1, 0]);

    println!("1 + 2 + 3 = {}", sum.await?);
    println!("10 / 4 = {}", quotient.await?);
    match oops.await {
        Ok(value) => println!("1 / 0 = {value}?!"),
        Err(e) => println!("1 / 0 failed: {e}"),
    }

    // This one goes on its own, and fails with a typed error
    let err = client
        .call::<_, f64>("sqrt", [2])
        .await
        .expect_err("there is no sqrt method");
    println!("sqrt failed with {:?}", err.typed_error().map(|e| e.name.as_str()));

    client
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Scheduler failed: {e}"))?;

    Ok(())
}
