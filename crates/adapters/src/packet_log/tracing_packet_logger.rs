use ports::secondary::packet_log_port::{PacketLogPort, PacketLogRecord};

/// Packet log sink that emits one structured `tracing` event per packet.
///
/// Events carry `event_type = "pflog"` so log pipelines can route them
/// apart from the agent's own diagnostics.
pub struct TracingPacketLogger;

impl PacketLogPort for TracingPacketLogger {
    fn log(&self, record: &PacketLogRecord) {
        tracing::info!(
            event_type = "pflog",
            verdict = %record.verdict,
            reason = record.reason.map(|r| r.as_str()),
            direction = %record.direction,
            interface = %record.ifname,
            rule = record.rule,
            anchor = record.anchor.as_deref(),
            ruleset = %record.ruleset,
            af = %record.af,
            proto = %record.proto,
            src = %record.src.display(record.af),
            sport = record.sport,
            dst = %record.dst.display(record.af),
            dport = record.dport,
            state = ?record.state,
            "packet"
        );
    }
}
