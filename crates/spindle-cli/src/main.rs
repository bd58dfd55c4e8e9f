use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spindle_core::{
    Answer, ContainerSpec, InMemorySpace, Request, RequestTimeout, RuntimeConfig, Selector,
    SpaceError, SpaceRuntime, TransactionTimeout,
};
use tracing_subscriber::EnvFilter;

/// 引数があれば JSON の RuntimeConfig として読む
fn load_config() -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(RuntimeConfig::from_json(&text)?)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config()?;
    let runtime = Arc::new(
        SpaceRuntime::builder(Arc::new(InMemorySpace::new()))
            .config(config)
            .build()?,
    );

    // (A) コンテナを作る
    let jobs = runtime
        .call(Request::CreateContainer {
            spec: ContainerSpec::named("jobs").with_capacity(2),
            transaction: None,
        })
        .await?
        .container()
        .ok_or("create_container answered without a container")?;
    println!("created container: {jobs}");

    // (B) 空のコンテナから take する consumer（エントリが来るまで待機）
    let consumer = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let mut received = Vec::new();
            loop {
                let answer = runtime
                    .call(Request::Take {
                        container: jobs,
                        selector: Selector::any(1),
                        timeout: RequestTimeout::Millis(500),
                        transaction: None,
                    })
                    .await;
                match answer {
                    Ok(Answer::Entries(entries)) => {
                        println!("consumer took: {entries:?}");
                        received.extend(entries);
                    }
                    Ok(other) => println!("unexpected answer: {other:?}"),
                    Err(err) if err.is_timeout() => break,
                    Err(err) => {
                        println!("consumer failed: {err}");
                        break;
                    }
                }
            }
            received
        })
    };

    // (C) トランザクション内で書く。commit まで consumer からは見えない
    let tx = runtime
        .call(Request::CreateTransaction {
            timeout: TransactionTimeout::Millis(10_000),
        })
        .await?
        .transaction()
        .ok_or("create_transaction answered without a transaction")?;
    for n in 0..2 {
        runtime
            .call(Request::Write {
                container: jobs,
                entries: vec![json!({ "job": n })],
                timeout: RequestTimeout::Millis(1_000),
                transaction: Some(tx),
            })
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("stats before commit: {}", serde_json::to_string(&runtime.stats())?);
    runtime
        .call(Request::CommitTransaction { transaction: tx })
        .await?;
    println!("committed {tx}");

    // capacity 2 なので、consumer が取るまで write は待つ
    for n in 2..4 {
        runtime
            .call(Request::Write {
                container: jobs,
                entries: vec![json!({ "job": n })],
                timeout: RequestTimeout::Millis(1_000),
                transaction: None,
            })
            .await?;
    }

    let received = consumer.await?;
    println!("consumer received {} entries", received.len());

    // (D) 起きていないリクエストは shutdown で ShuttingDown になる
    let leftover = runtime.submit(Request::Take {
        container: jobs,
        selector: Selector::any(1),
        timeout: RequestTimeout::Infinite,
        transaction: None,
    })?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("stats: {}", serde_json::to_string(&runtime.stats())?);
    runtime.shutdown(true).await;
    match leftover.wait().await {
        Err(SpaceError::ShuttingDown) => println!("parked take answered with shutdown"),
        other => println!("parked take answered: {other:?}"),
    }
    Ok(())
}
