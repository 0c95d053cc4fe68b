use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adapters::checksum::classifier_checksum::ClassifierChecksum;
use adapters::clock::system_clock::SystemClock;
use adapters::export::channel_exporter::ChannelExporter;
use adapters::export::json_lines_writer::write_json_lines;
use adapters::http::server::run_http_server;
use adapters::http::state::AppState;
use adapters::packet_log::tracing_packet_logger::TracingPacketLogger;
use adapters::pool::static_address_pool::StaticAddressPool;
use application::config_reload::ConfigReloadService;
use application::conntrack_service_impl::ConnTrackAppService;
use application::firewall_engine::{EngineConfig, FirewallEngine};
use application::firewall_service_impl::FirewallAppService;
use application::state_sweeper::StateSweeper;
use infrastructure::config::AgentConfig;
use infrastructure::constants::{EXPORT_CHANNEL_CAPACITY, GRACEFUL_SHUTDOWN_TIMEOUT, SWEEP_PERIOD};
use infrastructure::logging::init_logging;
use infrastructure::metrics::AgentMetrics;
use ports::secondary::clock_port::ClockPort;
use ports::secondary::metrics_port::MetricsPort;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::reload::{reload_plan, spawn_reload_task};
use crate::trace::{PacketRecord, VerdictRecord};

/// Engine plus the collaborators the agent keeps handles to.
pub struct EngineParts {
    pub engine: FirewallEngine,
    pub pool: Arc<StaticAddressPool>,
}

/// Build an engine from `config` with the standard adapters attached. The
/// ruleset is not loaded yet.
pub fn build_engine(
    config: &AgentConfig,
    clock: Arc<dyn ClockPort>,
    metrics: Arc<dyn MetricsPort>,
) -> anyhow::Result<EngineParts> {
    let engine_config = EngineConfig {
        creator_id: config.agent.creator_id,
        timeouts: config.timeouts()?,
        limits: config.limits()?,
        rng_seed: config.agent.rng_seed,
    };
    let pool = Arc::new(StaticAddressPool::new(config.interface_addresses()?));
    let engine = FirewallEngine::new(engine_config, clock, metrics)?
        .with_address_pool(Arc::clone(&pool) as _)
        .with_checksum(Arc::new(ClassifierChecksum::new(config.agent.strict_checksum)))
        .with_packet_log(Arc::new(TracingPacketLogger));
    Ok(EngineParts { engine, pool })
}

/// Run the agent startup sequence and block until shutdown.
#[allow(clippy::too_many_lines)] // startup is inherently sequential and long
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config ──────────────────────────────────────────────
    let config = AgentConfig::load(Path::new(&cli.config))?;

    // ── 2. Initialize logging ───────────────────────────────────────
    // CLI flags take precedence over config file
    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;

    // Service root span — fields appear in every subsequent log entry
    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "statewall",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        config_path = %cli.config,
        log_level = log_level.as_str(),
        log_format = log_format.as_str(),
        interfaces = ?config.agent.interfaces,
        "statewall agent starting"
    );

    // ── 3. Metrics and engine ───────────────────────────────────────
    let metrics = Arc::new(AgentMetrics::new());
    let EngineParts { engine, pool } = build_engine(
        &config,
        Arc::new(SystemClock::new()),
        Arc::clone(&metrics) as Arc<dyn MetricsPort>,
    )?;

    let cancel_token = crate::shutdown::create_shutdown_token();

    // ── 4. State export ─────────────────────────────────────────────
    let export_cancel = CancellationToken::new();
    let (engine, export_handle) = match config.agent.export_path.as_deref() {
        Some(path) => {
            let file = tokio::fs::File::create(path).await?;
            let (exporter, rx) = ChannelExporter::new(EXPORT_CHANNEL_CAPACITY);
            let handle = tokio::spawn(write_json_lines(rx, file, export_cancel.clone()));
            info!(path, capacity = EXPORT_CHANNEL_CAPACITY, "state export enabled");
            (engine.with_exporter(Arc::new(exporter)), Some(handle))
        }
        None => (engine, None),
    };
    let engine = Arc::new(engine);

    // ── 5. Tables, ruleset, timeouts ────────────────────────────────
    let reload_service = Arc::new(ConfigReloadService::new(Arc::clone(&engine)));
    let generation = reload_service.reload(reload_plan(&config)?).await?;
    info!(
        generation,
        rules = engine.ruleset().rule_count(),
        tables = config.tables.len(),
        "firewall engine initialized"
    );

    // ── 6. Background tasks ─────────────────────────────────────────
    let sweeper_cancel = cancel_token.child_token();
    let sweeper_handle = tokio::spawn(
        StateSweeper::new(Arc::clone(&engine))
            .with_period(SWEEP_PERIOD)
            .run(sweeper_cancel),
    );

    let reload_handle = spawn_reload_task(
        cli.config.clone(),
        Arc::clone(&reload_service),
        Arc::clone(&pool),
        cancel_token.clone(),
    );

    let http_handle = if config.agent.metrics_port == 0 {
        info!("status server disabled");
        None
    } else {
        let state = Arc::new(AppState::new(
            Arc::clone(&metrics),
            Arc::new(FirewallAppService::new(Arc::clone(&engine))),
            Arc::new(ConnTrackAppService::new(Arc::clone(&engine))),
        ));
        let bind_address = config.agent.bind_address.clone();
        let port = config.agent.metrics_port;
        let http_cancel = cancel_token.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_http_server(state, &bind_address, port, async move {
                http_cancel.cancelled().await;
            })
            .await
            {
                warn!(error = %e, "status server failed");
            }
        }))
    };

    // ── 7. Packet loop ──────────────────────────────────────────────
    info!("agent ready, reading packets from stdin");
    let processed = packet_loop(
        &engine,
        tokio::io::stdin(),
        tokio::io::stdout(),
        cancel_token.clone(),
    )
    .await?;
    info!(processed, "packet input closed, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 8. Ordered shutdown sequence ────────────────────────────────
    info!("shutdown phase 1: stopping sweeper and config reload");
    let _ = tokio::time::timeout(Duration::from_secs(1), sweeper_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), reload_handle).await;

    info!("shutdown phase 2: draining status server connections");
    if let Some(handle) = http_handle {
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await;
    }

    info!("shutdown phase 3: dropping states");
    let removed = engine.shutdown();

    info!("shutdown phase 4: flushing state export");
    export_cancel.cancel();
    if let Some(handle) = export_handle {
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(Ok(events))) => info!(events, "state export flushed"),
            Ok(Ok(Err(e))) => warn!(error = %e, "state export writer failed"),
            Ok(Err(e)) => warn!(error = %e, "state export task panicked"),
            Err(_) => warn!("state export did not drain in time"),
        }
    }

    info!(states = removed, "agent stopped");
    Ok(())
}

/// Read packet records from `input` until EOF or cancellation and write
/// one verdict line per record to `output`. Malformed records are logged
/// and skipped. Returns the number of packets evaluated.
pub async fn packet_loop<R, W>(
    engine: &FirewallEngine,
    input: R,
    mut output: W,
    cancel: CancellationToken,
) -> anyhow::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut seq = 0u64;
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let record = match PacketRecord::parse(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "skipping packet record");
                continue;
            }
        };
        let mut pkt = match record.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "skipping packet record");
                continue;
            }
        };
        seq += 1;
        let eval = engine.evaluate(pkt.af, record.direction, &record.interface, &mut pkt);
        let verdict = VerdictRecord::new(seq, engine.now(), &record, &pkt, eval);
        let mut out = serde_json::to_vec(&verdict)?;
        out.push(b'\n');
        output.write_all(&out).await?;
    }
    output.flush().await?;
    Ok(seq)
}

#[cfg(test)]
mod tests {
    use adapters::clock::replay_clock::ReplayClock;

    use super::*;

    fn config(yaml: &str) -> AgentConfig {
        AgentConfig::from_yaml(yaml).unwrap()
    }

    fn engine_for(yaml: &str) -> Arc<FirewallEngine> {
        let config = config(yaml);
        let parts = build_engine(
            &config,
            Arc::new(ReplayClock::new(1)),
            Arc::new(AgentMetrics::new()),
        )
        .unwrap();
        let (main, anchors, default) = config.firewall_rules().unwrap();
        parts.engine.load_ruleset(main, anchors, default).unwrap();
        Arc::new(parts.engine)
    }

    #[test]
    fn build_engine_applies_agent_settings() {
        let config = config(
            "agent:\n  interfaces: [em0]\n  creator_id: 9\n  addresses:\n    - { interface: em0, address: 10.1.1.1 }\nlimits:\n  states: 77\n",
        );
        let parts = build_engine(
            &config,
            Arc::new(ReplayClock::new(1)),
            Arc::new(AgentMetrics::new()),
        )
        .unwrap();
        assert_eq!(parts.pool.interface_count(), 1);
        assert_eq!(parts.engine.status().store.limits.states, 77);
    }

    #[tokio::test]
    async fn packet_loop_writes_one_line_per_packet() {
        let engine = engine_for(
            "agent:\n  interfaces: [em0]\nfirewall:\n  default_action: block\n  rules:\n    - { action: pass, direction: out, proto: udp }\n",
        );
        let input = concat!(
            r#"{"direction":"out","interface":"em0","proto":"udp","src":"10.0.0.1","sport":5000,"dst":"192.0.2.53","dport":53}"#,
            "\n\nnot json\n",
            r#"{"direction":"in","interface":"em0","proto":"udp","src":"192.0.2.53","sport":53,"dst":"10.0.0.1","dport":5000}"#,
            "\n",
            r#"{"direction":"in","interface":"em0","proto":"udp","src":"192.0.2.99","sport":53,"dst":"10.0.0.1","dport":5000}"#,
            "\n",
        );
        let mut out = Vec::new();
        let n = packet_loop(&engine, input.as_bytes(), &mut out, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 3);

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["verdict"], "pass");
        assert!(lines[0]["state"].is_object());
        assert_eq!(lines[1]["verdict"], "pass");
        assert_eq!(lines[1]["state"], lines[0]["state"]);
        assert_eq!(lines[2]["verdict"], "drop");
        assert_eq!(lines[2]["reason"], "match");
    }

    #[tokio::test]
    async fn packet_loop_stops_on_cancel() {
        let engine = engine_for("agent:\n  interfaces: [em0]\n");
        let token = CancellationToken::new();
        token.cancel();
        let (_client, server) = tokio::io::duplex(64);
        let n = packet_loop(&engine, server, Vec::new(), token).await.unwrap();
        assert_eq!(n, 0);
    }
}
