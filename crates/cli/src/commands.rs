use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    gatelink_client::{GatewayClient, RequestOptions, RetryPolicy, health},
    gatelink_config::GatelinkConfig,
    gatelink_orchestrator::MetricsAggregator,
    serde_json::{Value, json},
    tracing::{info, warn},
};

const CONNECT_WAIT: Duration = Duration::from_secs(15);

async fn connect(config: &GatelinkConfig) -> Result<GatewayClient> {
    let client = GatewayClient::from_config(config).context("failed to build gateway client")?;
    client
        .wait_until_connected(CONNECT_WAIT)
        .await
        .with_context(|| format!("could not connect to {}", config.gateway.url))?;
    Ok(client)
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to serialize output"),
    }
}

pub async fn call(
    config: &GatelinkConfig,
    method: &str,
    params: Option<&str>,
    timeout_ms: Option<u64>,
    retries: u32,
) -> Result<()> {
    let params: Option<Value> = params
        .map(serde_json::from_str)
        .transpose()
        .context("--params is not valid JSON")?;
    let mut opts = RequestOptions::default();
    if let Some(ms) = timeout_ms {
        opts = opts.timeout(Duration::from_millis(ms));
    }
    if retries > 0 {
        opts = opts.retry(RetryPolicy {
            max_attempts: retries + 1,
            ..Default::default()
        });
    }

    let client = connect(config).await?;
    let result = client.request_value(method, params, &opts).await;
    client.shutdown().await;

    let payload = result.with_context(|| format!("{method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

pub async fn watch(config: &GatelinkConfig, events: &[String]) -> Result<()> {
    let client = GatewayClient::from_config(config).context("failed to build gateway client")?;
    let status_task = client.on_status_change(|status| {
        print_json(&json!({ "connection": status }));
    });

    if events.is_empty() {
        client.on_any(|frame| print_json(&json!({ "event": frame })));
    } else {
        for name in events {
            client.on(name.as_str(), |frame| print_json(&json!({ "event": frame })));
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    client.shutdown().await;
    status_task.abort();
    Ok(())
}

pub async fn metrics(config: &GatelinkConfig, thread_id: &str) -> Result<()> {
    let client = connect(config).await?;
    let aggregator = MetricsAggregator::from_config(&config.orchestrator);
    let _attachment = aggregator.attach(&client);
    let mut sub = aggregator.subscribe(thread_id);

    if let Err(e) = aggregator.resync(&client, thread_id).await {
        warn!(thread_id, error = %e, "initial history fetch failed, following live events only");
    }
    print_json(&sub.current_snapshot());
    let _render = sub.on_update(|snapshot| print_json(snapshot));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = sub.changed() => {
                let Some(snapshot) = changed else { break };
                if snapshot.needs_resync && client.state().is_live() {
                    aggregator.resync_all(&client).await;
                }
            },
        }
    }
    client.shutdown().await;
    Ok(())
}

pub async fn health(config: &GatelinkConfig, timeout_ms: u64) -> Result<()> {
    let report = health::probe(&config.gateway.url, Duration::from_millis(timeout_ms)).await?;
    print_json(&report);
    if !report.healthy {
        bail!("gateway at {} is unhealthy", config.gateway.url);
    }
    Ok(())
}
