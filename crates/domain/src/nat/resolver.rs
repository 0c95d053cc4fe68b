//! Address and port selection for `nat-to`, `rdr-to` and `af-to`, and the
//! per-packet rewrite of translated states.

use std::sync::Arc;

use rand::{Rng, RngCore};
use tracing::debug;

use crate::common::entity::{Addr, AddressFamily, Direction};
use crate::common::packet::PacketInfo;
use crate::conntrack::entity::{State, StateKey};
use crate::conntrack::icmp::{IcmpKind, icmp_mapping, translate_icmp_type};
use crate::firewall::engine::Fnv64;
use crate::firewall::entity::{IpNetwork, Rule};
use crate::srctrack::engine::{Acquired, SourceTracker};
use crate::srctrack::entity::SrcNodeKind;

use super::entity::{
    AfTo, PF_NAT_PROXY_PORT_HIGH, PF_NAT_PROXY_PORT_LOW, Pool, PoolAddr, PoolType, Translated,
    TranslationKind,
};
use super::error::NatError;

/// Prefix length used to embed IPv4 addresses in IPv6 (RFC 6052 /96).
const NAT64_PREFIX_LEN: u8 = 96;

/// Everything the resolver needs from the state store and the host.
pub struct NatContext<'a> {
    pub rng: &'a mut dyn RngCore,
    pub sources: &'a mut SourceTracker,
    /// Whether a key is already owned by some state.
    pub key_in_use: &'a dyn Fn(&StateKey) -> bool,
    /// First address of an interface for a family.
    pub iface_addr: &'a dyn Fn(&str, AddressFamily) -> Option<Addr>,
    pub rdomain: u16,
    pub now: u64,
    /// Sticky-address nodes taken during resolution. The caller links them
    /// to the new state or aborts them.
    pub acquired: Vec<Acquired>,
}

impl TranslationKind {
    fn node_kind(self) -> SrcNodeKind {
        match self {
            Self::Nat => SrcNodeKind::Nat,
            Self::Rdr => SrcNodeKind::Rdr,
        }
    }
}

/// Resolve the translation `rule` asks for on a packet travelling in `dir`.
///
/// Returns the addressing the packet takes on the far side of the state.
pub fn resolve(
    rule: &Arc<Rule>,
    dir: Direction,
    orig: Translated,
    ctx: &mut NatContext<'_>,
) -> Result<Translated, NatError> {
    if let Some(afto) = &rule.af_to {
        return resolve_af(rule, afto, orig, ctx);
    }

    let mut out = orig;
    if let Some(pool) = &rule.nat {
        let naddr = map_addr(rule, pool, TranslationKind::Nat, orig.af, orig.src, ctx)?;
        let (naddr, nport) = search_port(rule, pool, dir, naddr, &out, ctx)?;
        out.src = naddr;
        out.sport = nport;
    }
    if let Some(pool) = &rule.rdr {
        let mut naddr = map_addr(rule, pool, TranslationKind::Rdr, orig.af, orig.src, ctx)?;
        if pool.pool_type == PoolType::Bitmask {
            let net = entry_network(pool, 0, orig.af, ctx)?;
            naddr = naddr.combine(net.mask(), orig.dst);
        }
        out.dst = naddr;
        if orig.proto.has_ports() {
            out.dport = rdr_port(rule, pool, orig.dport);
        }
    }
    debug!(
        rule = rule.nr,
        from = %orig.src.display(orig.af),
        to = %out.src.display(out.af),
        dst = %out.dst.display(out.af),
        "translation resolved"
    );
    Ok(out)
}

/// Destination port for `rdr-to`: a port range maps the original port
/// relative to the rule's destination port; a single port replaces it.
fn rdr_port(rule: &Rule, pool: &Pool, dport: u16) -> u16 {
    let ports = pool.ports;
    if ports.high != 0 {
        let base = u32::from(rule.dst.port.map_or(0, |op| op.low()));
        let span = u32::from(ports.high) - u32::from(ports.low) + 1;
        let mut nport = u32::from(dport).wrapping_sub(base) % span + u32::from(ports.low);
        if nport > 65535 {
            nport -= 65535;
        }
        nport as u16
    } else if ports.low != 0 {
        ports.low
    } else {
        dport
    }
}

// ── Address family translation ──────────────────────────────────────

fn resolve_af(
    rule: &Arc<Rule>,
    afto: &AfTo,
    orig: Translated,
    ctx: &mut NatContext<'_>,
) -> Result<Translated, NatError> {
    let naf = afto.af;
    let proto = if orig.proto.is_icmp() {
        naf.icmp_protocol()
    } else {
        orig.proto
    };
    let dport = if orig.proto.is_icmp() {
        // The virtual type of a query travels in the destination port.
        translate_icmp_type(orig.af, orig.dport as u8).map_or(orig.dport, u16::from)
    } else {
        orig.dport
    };

    let src = map_addr(rule, &afto.src, TranslationKind::Nat, naf, orig.src, ctx)?;
    let src = match naf {
        AddressFamily::Inet6 => {
            let prefix = entry_network(&afto.src, 0, naf, ctx)?.addr();
            embed_v4(prefix, orig.src)
        }
        AddressFamily::Inet => src,
    };

    let dst = match (&afto.dst, naf) {
        (Some(pool), AddressFamily::Inet) => {
            map_addr(rule, pool, TranslationKind::Rdr, naf, orig.src, ctx)?
        }
        (Some(pool), AddressFamily::Inet6) => {
            let prefix = entry_network(pool, 0, naf, ctx)?.addr();
            embed_v4(prefix, orig.dst)
        }
        (None, AddressFamily::Inet) => extract_v4(orig.dst),
        (None, AddressFamily::Inet6) => {
            let prefix = entry_network(&afto.src, 0, naf, ctx)?.addr();
            embed_v4(prefix, orig.dst)
        }
    };

    let mut out = Translated {
        af: naf,
        proto,
        src,
        sport: orig.sport,
        dst,
        dport,
    };
    // Replies to the translated side come back through the stack key, which
    // is keyed as an outbound packet.
    let (src, sport) = search_port(rule, &afto.src, Direction::Out, out.src, &out, ctx)?;
    out.src = src;
    out.sport = sport;
    Ok(out)
}

/// Place an IPv4 address in the low 32 bits of a /96 prefix.
pub fn embed_v4(prefix: Addr, v4: Addr) -> Addr {
    let mut out = prefix.masked(AddressFamily::Inet6, NAT64_PREFIX_LEN);
    out.0[3] = v4.0[0];
    out
}

/// IPv4 address carried in the low 32 bits of an IPv6 address.
pub fn extract_v4(v6: Addr) -> Addr {
    Addr::v4(v6.0[3])
}

// ── Pool address mapping ────────────────────────────────────────────

/// Network of pool entry `index`, resolving interface names.
fn entry_network(
    pool: &Pool,
    index: usize,
    af: AddressFamily,
    ctx: &NatContext<'_>,
) -> Result<IpNetwork, NatError> {
    let no_address = || NatError::NoAddress { af: af.to_string() };
    match pool.addrs.get(index).ok_or_else(no_address)? {
        PoolAddr::Network(net) if net.af() == af => Ok(*net),
        PoolAddr::Network(net) => Err(NatError::AfMismatch {
            pool: net.af().to_string(),
            rule: af.to_string(),
        }),
        PoolAddr::Interface(name) => (ctx.iface_addr)(name, af)
            .map(|addr| IpNetwork::host(af, addr))
            .ok_or_else(no_address),
    }
}

/// Pick a pool address for `saddr`, honouring sticky bindings.
fn map_addr(
    rule: &Arc<Rule>,
    pool: &Pool,
    kind: TranslationKind,
    af: AddressFamily,
    saddr: Addr,
    ctx: &mut NatContext<'_>,
) -> Result<Addr, NatError> {
    if !pool.sticky_address || pool.pool_type == PoolType::None {
        return choose(pool, af, saddr, ctx);
    }

    let acquired = ctx
        .sources
        .acquire(rule, kind.node_kind(), af, saddr, ctx.now)?;
    ctx.acquired.push(acquired);
    if let Some(raddr) = ctx.sources.get(&acquired.key).and_then(|n| n.raddr) {
        return Ok(raddr);
    }
    let naddr = choose(pool, af, saddr, ctx)?;
    ctx.sources.set_sticky(&acquired.key, naddr);
    Ok(naddr)
}

fn choose(
    pool: &Pool,
    af: AddressFamily,
    saddr: Addr,
    ctx: &mut NatContext<'_>,
) -> Result<Addr, NatError> {
    match pool.pool_type {
        PoolType::None => Ok(entry_network(pool, 0, af, ctx)?.addr()),
        PoolType::Bitmask => {
            let net = entry_network(pool, 0, af, ctx)?;
            Ok(net.addr().combine(net.mask(), saddr))
        }
        PoolType::SourceHash => {
            let net = entry_network(pool, 0, af, ctx)?;
            Ok(net.addr().combine(net.mask(), source_hash(saddr, pool.hash_key)))
        }
        PoolType::Random => {
            let index = ctx.rng.gen_range(0..pool.addrs.len().max(1));
            let net = entry_network(pool, index, af, ctx)?;
            let counter = match af {
                AddressFamily::Inet => Addr::v4(ctx.rng.next_u32()),
                AddressFamily::Inet6 => Addr(std::array::from_fn(|_| ctx.rng.next_u32())),
            };
            let naddr = net.addr().combine(net.mask(), counter);
            pool.with_cursor(|c| {
                c.index = index;
                c.counter = Some(naddr);
            });
            Ok(naddr)
        }
        PoolType::RoundRobin => round_robin(pool, af, ctx),
    }
}

/// Hand out the cursor address and advance it; move on to the next entry
/// once the current network is exhausted.
fn round_robin(pool: &Pool, af: AddressFamily, ctx: &NatContext<'_>) -> Result<Addr, NatError> {
    let (index, counter) = pool.with_cursor(|c| (c.index, c.counter));
    if let Some(counter) = counter
        && let Ok(net) = entry_network(pool, index, af, ctx)
        && net.contains(af, counter)
    {
        pool.with_cursor(|c| c.counter = Some(counter.increment(af)));
        return Ok(counter);
    }

    let next = if counter.is_none() {
        0
    } else {
        (index + 1) % pool.addrs.len().max(1)
    };
    let net = entry_network(pool, next, af, ctx)?;
    let naddr = net.addr().masked(af, net.prefix_len());
    pool.with_cursor(|c| {
        c.index = next;
        c.counter = Some(naddr.increment(af));
    });
    Ok(naddr)
}

/// Pick the next pool address after the ports of the current one ran out.
/// Only pools that can hand out more than one address retry.
fn next_addr(pool: &Pool, af: AddressFamily, ctx: &mut NatContext<'_>) -> Option<Addr> {
    match pool.pool_type {
        PoolType::RoundRobin => round_robin(pool, af, ctx).ok(),
        PoolType::Random => {
            let (index, counter) = pool.with_cursor(|c| (c.index, c.counter));
            let net = entry_network(pool, index, af, ctx).ok()?;
            let naddr = net
                .addr()
                .combine(net.mask(), counter.unwrap_or_default().increment(af));
            pool.with_cursor(|c| c.counter = Some(naddr));
            Some(naddr)
        }
        PoolType::None | PoolType::Bitmask | PoolType::SourceHash => None,
    }
}

/// Keyed hash of a source address spread over four words.
fn source_hash(addr: Addr, key: u64) -> Addr {
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let mut h = Fnv64::new();
        h.write(&key.to_be_bytes());
        h.write(&[i as u8]);
        for w in addr.0 {
            h.write(&w.to_be_bytes());
        }
        let v = h.finish();
        *word = (v >> 32) as u32 ^ v as u32;
    }
    Addr(words)
}

// ── Source port search ──────────────────────────────────────────────

/// Find a source port on `naddr` whose key is free, trying further pool
/// addresses when the window is exhausted.
fn search_port(
    rule: &Rule,
    pool: &Pool,
    dir: Direction,
    mut naddr: Addr,
    pkt: &Translated,
    ctx: &mut NatContext<'_>,
) -> Result<(Addr, u16), NatError> {
    let (low, high) = if pkt.proto.is_icmp() {
        (1, u16::MAX)
    } else if pool.static_port {
        (0, 0)
    } else if pool.ports.is_set() {
        (pool.ports.low.min(pool.ports.high), pool.ports.low.max(pool.ports.high))
    } else {
        (PF_NAT_PROXY_PORT_LOW, PF_NAT_PROXY_PORT_HIGH)
    };
    let init = naddr;

    loop {
        let key_for = |port: u16| {
            StateKey::for_packet(dir, pkt.af, pkt.proto, naddr, port, pkt.dst, pkt.dport, ctx.rdomain)
        };
        let free = |port: u16| !(ctx.key_in_use)(&key_for(port));

        if (!pkt.proto.has_ports() && !pkt.proto.is_icmp()) || (low == 0 && high == 0) {
            if free(pkt.sport) {
                return Ok((naddr, pkt.sport));
            }
        } else if pkt.proto.is_icmp() && free(pkt.sport) {
            return Ok((naddr, pkt.sport));
        } else if low == high {
            if free(low) {
                return Ok((naddr, low));
            }
        } else {
            let cut = ctx.rng.gen_range(low..=high);
            if let Some(port) = (cut..=high).chain((low..cut).rev()).find(|&p| free(p)) {
                return Ok((naddr, port));
            }
        }

        match next_addr(pool, pkt.af, ctx) {
            Some(next) if next != init => naddr = next,
            _ => {
                debug!(rule = rule.nr, low, high, "source ports exhausted");
                return Err(NatError::PortsExhausted { low, high });
            }
        }
    }
}

// ── State keys and rewrite ──────────────────────────────────────────

/// Wire and stack keys for a new state. Untranslated states share one key.
pub fn state_keys(
    dir: Direction,
    orig: &Translated,
    translated: Option<&Translated>,
    rdomain: u16,
) -> (Arc<StateKey>, Arc<StateKey>) {
    let key = |dir: Direction, t: &Translated| {
        StateKey::for_packet(dir, t.af, t.proto, t.src, t.sport, t.dst, t.dport, rdomain)
    };
    let Some(nt) = translated else {
        let k = Arc::new(key(dir, orig));
        return (Arc::clone(&k), k);
    };
    if nt.af != orig.af {
        return (Arc::new(key(Direction::In, orig)), Arc::new(key(Direction::Out, nt)));
    }
    let okey = key(dir, orig);
    let nkey = key(dir, nt);
    if okey == nkey {
        let k = Arc::new(okey);
        return (Arc::clone(&k), k);
    }
    match dir {
        Direction::In => (Arc::new(okey), Arc::new(nkey)),
        Direction::Out => (Arc::new(nkey), Arc::new(okey)),
    }
}

/// Addressing of a packet's descriptor.
pub fn packet_tuple(pkt: &PacketInfo) -> Translated {
    Translated {
        af: pkt.af,
        proto: pkt.proto,
        src: pkt.src,
        sport: pkt.sport,
        dst: pkt.dst,
        dport: pkt.dport,
    }
}

/// Rewrite `pkt` onto the other key of `state`. Returns `true` when the
/// address family changed.
pub fn translate(pkt: &mut PacketInfo, state: &State, dir: Direction) -> bool {
    if !state.is_translated() {
        return false;
    }
    let icmp_kind = pkt
        .icmp
        .as_ref()
        .map(|h| icmp_mapping(pkt.af, h.icmp_type, h.id));

    if state.wire.af != state.stack.af {
        // Both legs of an af-to state arrive inbound.
        let nk = if pkt.af == state.wire.af {
            &state.stack
        } else {
            &state.wire
        };
        let (s, d) = (dir.didx(), dir.sidx());
        let from = pkt.af;
        pkt.af = nk.af;
        pkt.proto = nk.protocol();
        pkt.rewrite(nk.addr[s], nk.port[s], nk.addr[d], nk.port[d]);
        if let Some(h) = pkt.icmp.as_mut()
            && let Some(t) = translate_icmp_type(from, h.icmp_type)
        {
            h.icmp_type = t;
        }
        set_icmp_id(pkt, icmp_kind);
        pkt.checksum_dirty = true;
        return true;
    }

    let nk = match dir {
        Direction::In => &state.stack,
        Direction::Out => &state.wire,
    };
    let (s, d) = (dir.sidx(), dir.didx());
    pkt.rewrite(nk.addr[s], nk.port[s], nk.addr[d], nk.port[d]);
    set_icmp_id(pkt, icmp_kind);
    false
}

/// Carry a translated virtual port back into the ICMP query id.
fn set_icmp_id(pkt: &mut PacketInfo, kind: Option<IcmpKind>) {
    let id = match kind {
        Some(IcmpKind::Query {
            dir: Direction::In, ..
        }) => pkt.sport,
        Some(IcmpKind::Query {
            dir: Direction::Out,
            ..
        }) => pkt.dport,
        _ => return,
    };
    if let Some(h) = pkt.icmp.as_mut()
        && h.id != id
    {
        h.id = id;
        pkt.checksum_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::common::entity::Protocol;
    use crate::common::packet::IcmpHeader;
    use crate::conntrack::entity::{Peer, StateFlags, StateId, StateInner, TimeoutClass};
    use crate::firewall::entity::PortOp;
    use crate::nat::entity::AfTo;

    fn v4net(addr: u32, prefix_len: u8) -> IpNetwork {
        IpNetwork::V4 { addr, prefix_len }
    }

    fn tuple(src: u32, sport: u16, dst: u32, dport: u16) -> Translated {
        Translated {
            af: AddressFamily::Inet,
            proto: Protocol::Tcp,
            src: Addr::v4(src),
            sport,
            dst: Addr::v4(dst),
            dport,
        }
    }

    fn no_iface(_: &str, _: AddressFamily) -> Option<Addr> {
        None
    }

    fn never_used(_: &StateKey) -> bool {
        false
    }

    struct Harness {
        rng: StdRng,
        sources: SourceTracker,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                rng: StdRng::seed_from_u64(42),
                sources: SourceTracker::new(100),
            }
        }

        fn ctx<'a>(
            &'a mut self,
            in_use: &'a dyn Fn(&StateKey) -> bool,
            iface: &'a dyn Fn(&str, AddressFamily) -> Option<Addr>,
        ) -> NatContext<'a> {
            NatContext {
                rng: &mut self.rng,
                sources: &mut self.sources,
                key_in_use: in_use,
                iface_addr: iface,
                rdomain: 0,
                now: 10,
                acquired: Vec::new(),
            }
        }
    }

    fn nat_rule(pool: Pool) -> Arc<Rule> {
        Arc::new(Rule {
            uid: 3,
            nat: Some(Arc::new(pool)),
            ..Rule::default()
        })
    }

    fn rdr_rule(pool: Pool, dst_port: Option<PortOp>) -> Arc<Rule> {
        let mut rule = Rule {
            uid: 4,
            proto: Some(Protocol::Tcp),
            rdr: Some(Arc::new(pool)),
            ..Rule::default()
        };
        rule.dst.port = dst_port;
        Arc::new(rule)
    }

    // ── nat-to ────────────────────────────────────────────────────

    #[test]
    fn nat_picks_port_from_default_window() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let rule = nat_rule(Pool::single(v4net(0xC633_6401, 32)));
        let out = resolve(&rule, Direction::Out, tuple(0x0A00_0001, 1234, 0x5DB8_D822, 80), &mut ctx)
            .unwrap();
        assert_eq!(out.src, Addr::v4(0xC633_6401));
        assert!((PF_NAT_PROXY_PORT_LOW..=PF_NAT_PROXY_PORT_HIGH).contains(&out.sport));
        assert_eq!((out.dst, out.dport), (Addr::v4(0x5DB8_D822), 80));
    }

    #[test]
    fn static_port_keeps_source_port() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let rule = nat_rule(Pool::single(v4net(0xC633_6401, 32)).with_static_port());
        let out = resolve(&rule, Direction::Out, tuple(0x0A00_0001, 1234, 2, 80), &mut ctx).unwrap();
        assert_eq!(out.sport, 1234);
    }

    #[test]
    fn port_search_skips_keys_in_use() {
        let mut h = Harness::new();
        let in_use = |k: &StateKey| k.port[1] != 1002;
        let mut ctx = h.ctx(&in_use, &no_iface);
        let rule = nat_rule(Pool::single(v4net(0xC633_6401, 32)).with_ports(1000, 1005));
        let out = resolve(&rule, Direction::Out, tuple(0x0A00_0001, 1234, 2, 80), &mut ctx).unwrap();
        assert_eq!(out.sport, 1002);
    }

    #[test]
    fn exhausted_window_fails_for_single_address() {
        let mut h = Harness::new();
        let all = |_: &StateKey| true;
        let mut ctx = h.ctx(&all, &no_iface);
        let rule = nat_rule(Pool::single(v4net(0xC633_6401, 32)).with_ports(1000, 1001));
        let err = resolve(&rule, Direction::Out, tuple(1, 1234, 2, 80), &mut ctx).unwrap_err();
        assert!(matches!(err, NatError::PortsExhausted { low: 1000, high: 1001 }));
    }

    #[test]
    fn round_robin_moves_to_next_address_when_ports_run_out() {
        let mut h = Harness::new();
        let first = Addr::v4(0xC633_6401);
        let in_use = move |k: &StateKey| k.addr[1] == first;
        let mut ctx = h.ctx(&in_use, &no_iface);
        let pool = Pool::new(
            vec![
                PoolAddr::Network(v4net(0xC633_6401, 32)),
                PoolAddr::Network(v4net(0xC633_6402, 32)),
            ],
            PoolType::RoundRobin,
        )
        .with_ports(1000, 1001);
        let rule = nat_rule(pool);
        let out = resolve(&rule, Direction::Out, tuple(1, 1234, 2, 80), &mut ctx).unwrap();
        assert_eq!(out.src, Addr::v4(0xC633_6402));
    }

    #[test]
    fn round_robin_cycles_through_entries_and_hosts() {
        let mut h = Harness::new();
        let ctx = h.ctx(&never_used, &no_iface);
        let pool = Pool::new(
            vec![
                PoolAddr::Network(v4net(0x0A00_0000, 31)),
                PoolAddr::Network(v4net(0x0B00_0001, 32)),
            ],
            PoolType::RoundRobin,
        );
        let picks: Vec<u32> = (0..4)
            .map(|_| round_robin(&pool, AddressFamily::Inet, &ctx).unwrap().0[0])
            .collect();
        assert_eq!(picks, vec![0x0A00_0000, 0x0A00_0001, 0x0B00_0001, 0x0A00_0000]);
    }

    #[test]
    fn bitmask_keeps_host_bits() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let rule = nat_rule(Pool::new(
            vec![PoolAddr::Network(v4net(0xC633_6400, 24))],
            PoolType::Bitmask,
        ));
        let out = resolve(&rule, Direction::Out, tuple(0x0A00_0017, 1, 2, 80), &mut ctx).unwrap();
        assert_eq!(out.src, Addr::v4(0xC633_6417));
    }

    #[test]
    fn source_hash_is_stable_per_source() {
        let pool = Pool::new(
            vec![PoolAddr::Network(v4net(0xC633_6400, 24))],
            PoolType::SourceHash,
        )
        .with_hash_key(0xfeed);
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let a = choose(&pool, AddressFamily::Inet, Addr::v4(1), &mut ctx).unwrap();
        let b = choose(&pool, AddressFamily::Inet, Addr::v4(1), &mut ctx).unwrap();
        assert_eq!(a, b);
        assert!(v4net(0xC633_6400, 24).contains(AddressFamily::Inet, a));
        let spread: HashSet<Addr> = (0..64)
            .map(|n| choose(&pool, AddressFamily::Inet, Addr::v4(n), &mut ctx).unwrap())
            .collect();
        assert!(spread.len() > 8);
    }

    #[test]
    fn random_pool_stays_inside_network() {
        let pool = Pool::new(vec![PoolAddr::Network(v4net(0xC633_6400, 28))], PoolType::Random);
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        for _ in 0..32 {
            let a = choose(&pool, AddressFamily::Inet, Addr::v4(1), &mut ctx).unwrap();
            assert!(v4net(0xC633_6400, 28).contains(AddressFamily::Inet, a));
        }
    }

    #[test]
    fn interface_entry_resolves_through_callback() {
        let mut h = Harness::new();
        let iface = |name: &str, af: AddressFamily| {
            (name == "em0" && af == AddressFamily::Inet).then_some(Addr::v4(0xC000_0201))
        };
        let mut ctx = h.ctx(&never_used, &iface);
        let rule = nat_rule(Pool::new(
            vec![PoolAddr::Interface("em0".to_string())],
            PoolType::None,
        ));
        let out = resolve(&rule, Direction::Out, tuple(1, 1, 2, 80), &mut ctx).unwrap();
        assert_eq!(out.src, Addr::v4(0xC000_0201));

        let rule = nat_rule(Pool::new(
            vec![PoolAddr::Interface("em9".to_string())],
            PoolType::None,
        ));
        assert!(matches!(
            resolve(&rule, Direction::Out, tuple(1, 1, 2, 80), &mut ctx),
            Err(NatError::NoAddress { .. })
        ));
    }

    #[test]
    fn sticky_address_reuses_binding() {
        let mut h = Harness::new();
        let pool = Pool::new(
            vec![
                PoolAddr::Network(v4net(0xC633_6401, 32)),
                PoolAddr::Network(v4net(0xC633_6402, 32)),
            ],
            PoolType::RoundRobin,
        )
        .with_sticky_address();
        let rule = nat_rule(pool);
        let first = {
            let mut ctx = h.ctx(&never_used, &no_iface);
            let out = resolve(&rule, Direction::Out, tuple(7, 1, 2, 80), &mut ctx).unwrap();
            assert_eq!(ctx.acquired.len(), 1);
            out.src
        };
        let mut ctx = h.ctx(&never_used, &no_iface);
        let again = resolve(&rule, Direction::Out, tuple(7, 2, 2, 80), &mut ctx).unwrap();
        let other = resolve(&rule, Direction::Out, tuple(8, 2, 2, 80), &mut ctx).unwrap();
        assert_eq!(again.src, first);
        assert_ne!(other.src, first);
        let key = ctx.acquired[0].key;
        drop(ctx);
        assert_eq!(h.sources.get(&key).unwrap().states, 2);
    }

    // ── rdr-to ────────────────────────────────────────────────────

    #[test]
    fn rdr_maps_port_range_relative_to_rule_port() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let pool = Pool::single(v4net(0x0A00_000A, 32)).with_ports(8000, 8009);
        let rule = rdr_rule(pool, Some(PortOp::Range(2000, 2009)));
        let out = resolve(&rule, Direction::In, tuple(1, 5555, 0xC633_6401, 2003), &mut ctx).unwrap();
        assert_eq!((out.dst, out.dport), (Addr::v4(0x0A00_000A), 8003));
        assert_eq!((out.src, out.sport), (Addr::v4(1), 5555));
    }

    #[test]
    fn rdr_single_port_and_passthrough() {
        let pool = Pool::single(v4net(0x0A00_000A, 32)).with_ports(8080, 0);
        let rule = rdr_rule(pool, None);
        assert_eq!(rdr_port(&rule, rule.rdr.as_ref().unwrap(), 80), 8080);
        let pool = Pool::single(v4net(0x0A00_000A, 32));
        let rule = rdr_rule(pool, None);
        assert_eq!(rdr_port(&rule, rule.rdr.as_ref().unwrap(), 80), 80);
    }

    // ── af-to ─────────────────────────────────────────────────────

    #[test]
    fn nat64_extracts_v4_destination() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let rule = Arc::new(Rule {
            af_to: Some(Arc::new(AfTo {
                af: AddressFamily::Inet,
                src: Pool::single(v4net(0xC633_6401, 32)),
                dst: None,
            })),
            ..Rule::default()
        });
        let orig = Translated {
            af: AddressFamily::Inet6,
            proto: Protocol::Tcp,
            src: Addr::v6([0x2001_0db8, 0, 0, 1]),
            sport: 4000,
            dst: Addr::v6([0x0064_ff9b, 0, 0, 0x5DB8_D822]),
            dport: 80,
        };
        let out = resolve(&rule, Direction::In, orig, &mut ctx).unwrap();
        assert_eq!(out.af, AddressFamily::Inet);
        assert_eq!(out.src, Addr::v4(0xC633_6401));
        assert_eq!(out.dst, Addr::v4(0x5DB8_D822));
        assert_eq!(out.dport, 80);
    }

    #[test]
    fn nat46_embeds_into_prefix_and_swaps_icmp() {
        let mut h = Harness::new();
        let mut ctx = h.ctx(&never_used, &no_iface);
        let prefix = IpNetwork::V6 {
            addr: Addr::v6([0x0064_ff9b, 0, 0, 0]).to_v6_octets(),
            prefix_len: 96,
        };
        let rule = Arc::new(Rule {
            af_to: Some(Arc::new(AfTo {
                af: AddressFamily::Inet6,
                src: Pool::single(prefix),
                dst: None,
            })),
            ..Rule::default()
        });
        let orig = Translated {
            af: AddressFamily::Inet,
            proto: Protocol::Icmp,
            src: Addr::v4(0x0A00_0001),
            sport: 7,
            dst: Addr::v4(0x0A00_0002),
            dport: 8,
        };
        let out = resolve(&rule, Direction::In, orig, &mut ctx).unwrap();
        assert_eq!(out.proto, Protocol::Icmpv6);
        assert_eq!(out.src, Addr::v6([0x0064_ff9b, 0, 0, 0x0A00_0001]));
        assert_eq!(out.dst, Addr::v6([0x0064_ff9b, 0, 0, 0x0A00_0002]));
        assert_eq!((out.sport, out.dport), (7, 128));
    }

    #[test]
    fn embed_and_extract_are_inverse() {
        let prefix = Addr::v6([0x0064_ff9b, 0, 0, 0xdead]);
        let v6 = embed_v4(prefix, Addr::v4(0x0102_0304));
        assert_eq!(v6, Addr::v6([0x0064_ff9b, 0, 0, 0x0102_0304]));
        assert_eq!(extract_v4(v6), Addr::v4(0x0102_0304));
    }

    // ── Keys and rewrite ──────────────────────────────────────────

    fn state_for(wire: Arc<StateKey>, stack: Arc<StateKey>, dir: Direction) -> State {
        State::new(
            StateId { id: 1, creator: 1 },
            wire,
            stack,
            None,
            dir,
            Arc::new(Rule::default()),
            0,
            StateInner {
                src: Peer::default(),
                dst: Peer::default(),
                timeout: TimeoutClass::TcpFirstPacket,
                expire: 0,
                packets: [0; 2],
                bytes: [0; 2],
                flags: StateFlags::default(),
            },
        )
    }

    #[test]
    fn untranslated_keys_share_one_arc() {
        let t = tuple(1, 2, 3, 4);
        let (w, s) = state_keys(Direction::Out, &t, Some(&t), 0);
        assert!(Arc::ptr_eq(&w, &s));
        let (w, s) = state_keys(Direction::Out, &t, None, 0);
        assert!(Arc::ptr_eq(&w, &s));
    }

    #[test]
    fn nat_round_trip_restores_original_addressing() {
        let orig = tuple(0x0A00_0001, 1234, 0x5DB8_D822, 80);
        let nat = tuple(0xC633_6401, 50001, 0x5DB8_D822, 80);
        let (wire, stack) = state_keys(Direction::Out, &orig, Some(&nat), 0);
        assert_eq!(wire.port, [80, 50001]);
        assert_eq!(stack.port, [80, 1234]);
        let state = state_for(wire, stack, Direction::Out);

        let mut out = PacketInfo::tcp(
            AddressFamily::Inet,
            orig.src,
            orig.sport,
            orig.dst,
            orig.dport,
            Default::default(),
        );
        assert!(!translate(&mut out, &state, Direction::Out));
        assert_eq!((out.src, out.sport), (nat.src, nat.sport));
        assert!(out.checksum_dirty);

        let mut reply = PacketInfo::tcp(
            AddressFamily::Inet,
            nat.dst,
            nat.dport,
            nat.src,
            nat.sport,
            Default::default(),
        );
        translate(&mut reply, &state, Direction::In);
        assert_eq!((reply.dst, reply.dport), (orig.src, orig.sport));
        assert_eq!((reply.src, reply.sport), (orig.dst, orig.dport));

        // Rewriting an already-translated packet changes nothing.
        let before = reply.clone();
        translate(&mut reply, &state, Direction::In);
        assert_eq!(reply, before);
    }

    #[test]
    fn icmp_id_follows_translated_port() {
        let orig = Translated {
            proto: Protocol::Icmp,
            ..tuple(0x0A00_0001, 7, 0x0A00_0002, 8)
        };
        let nat = Translated {
            src: Addr::v4(0xC633_6401),
            sport: 9,
            ..orig
        };
        let (wire, stack) = state_keys(Direction::Out, &orig, Some(&nat), 0);
        let state = state_for(wire, stack, Direction::Out);
        let mut pkt = PacketInfo::icmp(
            AddressFamily::Inet,
            orig.src,
            orig.dst,
            IcmpHeader {
                icmp_type: 8,
                code: 0,
                id: 7,
                inner: None,
            },
        );
        pkt.sport = 7;
        pkt.dport = 8;
        translate(&mut pkt, &state, Direction::Out);
        assert_eq!(pkt.icmp.as_ref().unwrap().id, 9);
        assert_eq!(pkt.src, nat.src);
    }

    #[test]
    fn af_to_rewrites_both_legs() {
        let orig = Translated {
            af: AddressFamily::Inet6,
            proto: Protocol::Tcp,
            src: Addr::v6([0x2001_0db8, 0, 0, 1]),
            sport: 4000,
            dst: Addr::v6([0x0064_ff9b, 0, 0, 0x5DB8_D822]),
            dport: 80,
        };
        let nt = tuple(0xC633_6401, 50001, 0x5DB8_D822, 80);
        let (wire, stack) = state_keys(Direction::In, &orig, Some(&nt), 0);
        let state = state_for(wire, stack, Direction::In);

        let mut fwd = PacketInfo::tcp(orig.af, orig.src, orig.sport, orig.dst, orig.dport, Default::default());
        assert!(translate(&mut fwd, &state, Direction::In));
        assert_eq!(fwd.af, AddressFamily::Inet);
        assert_eq!((fwd.src, fwd.sport, fwd.dst, fwd.dport), (nt.src, nt.sport, nt.dst, nt.dport));

        let mut back = PacketInfo::tcp(nt.af, nt.dst, nt.dport, nt.src, nt.sport, Default::default());
        assert!(translate(&mut back, &state, Direction::In));
        assert_eq!(back.af, AddressFamily::Inet6);
        assert_eq!((back.src, back.sport), (orig.dst, orig.dport));
        assert_eq!((back.dst, back.dport), (orig.src, orig.sport));
    }
}
