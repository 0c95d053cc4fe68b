use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use adapters::clock::replay_clock::ReplayClock;
use anyhow::Context;
use application::config_reload::ConfigReloadService;
use application::firewall_engine::EngineStatus;
use application::state_sweeper::StateSweeper;
use infrastructure::config::AgentConfig;
use infrastructure::metrics::AgentMetrics;
use ports::secondary::clock_port::ClockPort;
use ports::secondary::metrics_port::MetricsPort;
use serde::Serialize;

use crate::reload::reload_plan;
use crate::startup::{EngineParts, build_engine};
use crate::trace::{PacketRecord, VerdictRecord};

/// Sweeper steps run for one gap in a trace. Longer gaps are cut short;
/// states then expire on later steps.
const MAX_CATCHUP_STEPS: u64 = 3600;

/// Summary of a compiled configuration.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub rules: usize,
    pub anchors: usize,
    pub tables: usize,
    pub checksum: String,
}

/// One line of replay output.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayLine {
    Verdict(VerdictRecord),
    Summary { packets: u64, status: EngineStatus },
}

/// Load, validate and compile the configuration without running it.
pub async fn cmd_check(config_path: &str, out: &mut impl Write) -> anyhow::Result<CheckReport> {
    let config = AgentConfig::load(Path::new(config_path))
        .with_context(|| format!("loading {config_path}"))?;
    let EngineParts { engine, .. } = build_engine(
        &config,
        Arc::new(ReplayClock::new(1)),
        Arc::new(AgentMetrics::new()) as Arc<dyn MetricsPort>,
    )?;
    let engine = Arc::new(engine);
    let plan = reload_plan(&config)?;
    let anchors = plan.anchors.len();
    let tables = plan.tables.len();
    ConfigReloadService::new(Arc::clone(&engine))
        .reload(plan)
        .await
        .context("ruleset does not compile")?;

    let ruleset = engine.ruleset();
    let report = CheckReport {
        rules: ruleset.rule_count(),
        anchors,
        tables,
        checksum: format!("{:016x}", ruleset.checksum()),
    };
    writeln!(
        out,
        "configuration OK: {} rules, {} anchors, {} tables, checksum {}",
        report.rules, report.anchors, report.tables, report.checksum
    )?;
    Ok(report)
}

/// Run every record of `trace` through a fresh engine. Time follows the
/// records' `at` fields; the sweeper runs once per elapsed second.
pub async fn cmd_replay(config_path: &str, trace: &Path, out: &mut impl Write) -> anyhow::Result<u64> {
    let config = AgentConfig::load(Path::new(config_path))
        .with_context(|| format!("loading {config_path}"))?;
    let file = std::fs::File::open(trace).with_context(|| format!("opening {}", trace.display()))?;

    let clock = Arc::new(ReplayClock::new(1));
    let EngineParts { engine, .. } = build_engine(
        &config,
        Arc::clone(&clock) as _,
        Arc::new(AgentMetrics::new()) as Arc<dyn MetricsPort>,
    )?;
    let engine = Arc::new(engine);
    ConfigReloadService::new(Arc::clone(&engine))
        .reload(reload_plan(&config)?)
        .await?;

    let mut sweeper = StateSweeper::new(Arc::clone(&engine));
    let mut packets = 0u64;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let lineno = idx + 1;
        let record = PacketRecord::parse(&line).with_context(|| format!("line {lineno}"))?;
        let mut pkt = record.to_packet().with_context(|| format!("line {lineno}"))?;

        if let Some(at) = record.at {
            let before = clock.now_secs();
            let now = clock.advance_to(at);
            for _ in 0..(now - before).min(MAX_CATCHUP_STEPS) {
                sweeper.tick();
            }
        }

        packets += 1;
        let eval = engine.evaluate(pkt.af, record.direction, &record.interface, &mut pkt);
        let verdict = VerdictRecord::new(packets, engine.now(), &record, &pkt, eval);
        serde_json::to_writer(&mut *out, &ReplayLine::Verdict(verdict))?;
        writeln!(out)?;
    }

    let summary = ReplayLine::Summary {
        packets,
        status: engine.status(),
    };
    serde_json::to_writer(&mut *out, &summary)?;
    writeln!(out)?;
    Ok(packets)
}
