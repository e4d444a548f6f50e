use std::collections::HashMap;
use std::net::IpAddr;

use log::{debug, trace, warn};

use crate::parser::ParserStream;
use crate::rangeaddr::ReconnectRanges;
use crate::report::Reporter;
use crate::tcb::{Tcb, TcbKey};
use crate::timer::{Tick, TimerWheel};

const MIN_CAPACITY: usize = 1 << 10;
const MAX_CAPACITY: usize = 1 << 24;

/// Symmetric 4-tuple hash (`SPEC_FULL.md` §3 invariant 2, §4.D).
///
/// Shares the "XOR both directions together, then mix" shape of
/// `crate::cookie::syn_cookie`, generalized to `IpAddr` so the table can
/// bucket IPv6 entries with the same function (even though, per
/// `DESIGN.md`, the engine's own wire codecs never originate one).
fn table_hash(ip_local: IpAddr, ip_remote: IpAddr, port_local: u16, port_remote: u16, entropy: u64) -> u64 {
    fn addr_bits(a: IpAddr) -> u128 {
        match a {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        }
    }

    let ip_mix = addr_bits(ip_local) ^ addr_bits(ip_remote);
    let port_mix = (port_local as u64) ^ (port_remote as u64);

    let mut h = entropy;
    h = h
        .wrapping_mul(0x9E3779B97F4A7C15)
        .wrapping_add((ip_mix as u64) ^ ((ip_mix >> 64) as u64));
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd).wrapping_add(port_mix);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Why a TCB was destroyed, for logging (`SPEC_FULL.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Reset,
    Timeout,
    GracefulClose,
    Shutdown,
}

/// The connection table (`SPEC_FULL.md` §4.D): a fixed bucket array of TCBs
/// with freelist reuse, plus the timer wheel, reporter, parser registry, and
/// reconnect ranges it owns on the state machine's behalf.
pub struct Table {
    slots: Vec<Option<Tcb>>,
    generations: Vec<u32>,
    free_list: Vec<u32>,
    buckets: Vec<Vec<TcbKey>>,
    mask: u64,
    active_count: usize,

    pub timer: TimerWheel,
    pub entropy: u64,
    pub conn_timeout_secs: u64,
    pub hello_timeout_secs: u64,
    pub reconnect: ReconnectRanges,

    pub reporter: Box<dyn Reporter>,
    pub parsers: Vec<Box<dyn ParserStream>>,
    /// Per-port static hello overrides (`SPEC_FULL.md` §6 `hello-string[<port>]`),
    /// resolved from `crate::config::Config::hello_strings` once at
    /// `Engine::new` time, the same way `parsers` is assigned.
    pub hello_overrides: HashMap<u16, Vec<u8>>,
    /// Applied to every TCB this table creates (`SPEC_FULL.md` §4.I: set
    /// automatically by `Config::set_tls_probe(Heartbleed)`).
    pub small_window_default: bool,
}

impl Table {
    /// Create a table. `capacity` is clamped to `[2^10, 2^24]` and rounded
    /// up to the next power of two (`SPEC_FULL.md` §4.D).
    pub fn new(
        capacity: usize,
        entropy: u64,
        conn_timeout_secs: u64,
        hello_timeout_secs: u64,
        reconnect: ReconnectRanges,
        reporter: Box<dyn Reporter>,
    ) -> Table {
        let clamped = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let buckets_len = clamped.next_power_of_two();
        Table {
            slots: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
            buckets: (0..buckets_len).map(|_| Vec::new()).collect(),
            mask: (buckets_len - 1) as u64,
            active_count: 0,
            timer: TimerWheel::new(),
            entropy,
            conn_timeout_secs,
            hello_timeout_secs,
            reconnect,
            reporter,
            parsers: Vec::new(),
            hello_overrides: HashMap::new(),
            small_window_default: false,
        }
    }

    /// Arm the timer for `key` at `tick`, and record the tick on the TCB
    /// itself so `remove_expired`'s stale-hint check and the safety net
    /// (`crate::state::ensure_timer`) can validate against it.
    pub fn arm_timer(&mut self, key: TcbKey, tick: Tick) {
        self.timer.add(key, tick);
        if let Some(tcb) = self.get_mut(key) {
            tcb.timer_tick = Some(tick);
        }
    }

    fn bucket_of(&self, ip_local: IpAddr, ip_remote: IpAddr, port_local: u16, port_remote: u16) -> usize {
        (table_hash(ip_local, ip_remote, port_local, port_remote, self.entropy) & self.mask) as usize
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn get(&self, key: TcbKey) -> Option<&Tcb> {
        if self.generations.get(key.index())? != &key.generation() {
            return None;
        }
        self.slots[key.index()].as_ref()
    }

    pub fn get_mut(&mut self, key: TcbKey) -> Option<&mut Tcb> {
        if *self.generations.get(key.index())? != key.generation() {
            return None;
        }
        self.slots[key.index()].as_mut()
    }

    /// Borrow a TCB together with its assigned parser stream, split so
    /// neither borrow goes through the other (`self.slots` and
    /// `self.parsers` are disjoint fields; doing this as two separate
    /// `&mut self` method calls wouldn't compile, but direct field access in
    /// one method does).
    pub fn tcb_and_parser(&mut self, key: TcbKey) -> Option<(&mut Tcb, &dyn ParserStream)> {
        if *self.generations.get(key.index())? != key.generation() {
            return None;
        }
        let tcb = self.slots[key.index()].as_mut()?;
        let parser = self.parsers.get(tcb.stream)?.as_ref();
        Some((tcb, parser))
    }

    /// Same as `tcb_and_parser`, but with a mutably-borrowed parser (for
    /// `ParserStream::parse`, which needs to update its own scratch state).
    pub fn tcb_and_parser_mut(&mut self, key: TcbKey) -> Option<(&mut Tcb, &mut dyn ParserStream)> {
        if *self.generations.get(key.index())? != key.generation() {
            return None;
        }
        let tcb = self.slots[key.index()].as_mut()?;
        let parser = self.parsers.get_mut(tcb.stream)?.as_mut();
        Some((tcb, parser))
    }

    /// Find an existing TCB for this 4-tuple.
    pub fn lookup(&self, ip_local: IpAddr, ip_remote: IpAddr, port_local: u16, port_remote: u16) -> Option<TcbKey> {
        let bucket = self.bucket_of(ip_local, ip_remote, port_local, port_remote);
        self.buckets[bucket].iter().copied().find(|&key| {
            self.get(key)
                .is_some_and(|t| t.matches(ip_local, ip_remote, port_local, port_remote))
        })
    }

    /// Idempotent create: returns the existing TCB if a matching 4-tuple is
    /// already present, otherwise allocates one from the freelist or grows
    /// the arena (`SPEC_FULL.md` §4.D).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        ip_local: IpAddr,
        ip_remote: IpAddr,
        port_local: u16,
        port_remote: u16,
        seq_local: u32,
        seq_remote: u32,
        ttl: u8,
        stream: usize,
        now: Tick,
    ) -> TcbKey {
        if let Some(existing) = self.lookup(ip_local, ip_remote, port_local, port_remote) {
            return existing;
        }

        let tcb = Tcb::new(
            ip_local, ip_remote, port_local, port_remote, seq_local, seq_remote, ttl,
            self.small_window_default, stream, now,
        );

        let key = if let Some(index) = self.free_list.pop() {
            let gen = self.generations[index as usize];
            self.slots[index as usize] = Some(tcb);
            TcbKey::new(index, gen)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(tcb));
            self.generations.push(0);
            TcbKey::new(index, 0)
        };

        let bucket = self.bucket_of(ip_local, ip_remote, port_local, port_remote);
        self.buckets[bucket].push(key);
        self.active_count += 1;
        debug!(
            "tcb: create {ip_local}:{port_local} -> {ip_remote}:{port_remote} (bucket {bucket})"
        );
        key
    }

    /// Destroy a TCB: delink from its bucket and the timer wheel, flush its
    /// banner to the reporter, bump its generation, and return the slot to
    /// the freelist (`SPEC_FULL.md` §4.D, §7 double-free detection).
    pub fn destroy(&mut self, key: TcbKey, reason: DestroyReason, now_secs: u64) {
        if self.generations.get(key.index()).copied() != Some(key.generation()) {
            warn!("tcb: double free detected for {key:?}, ignoring");
            return;
        }
        let Some(mut tcb) = self.slots[key.index()].take() else {
            warn!("tcb: double free detected for {key:?}, ignoring");
            return;
        };

        let bucket = self.bucket_of(tcb.ip_local, tcb.ip_remote, tcb.port_local, tcb.port_remote);
        self.buckets[bucket].retain(|&k| k != key);

        // Flush exactly once, even if the banner is empty (invariant 7 in
        // `SPEC_FULL.md` §3 is about call count, not content).
        let stream_name = self
            .parsers
            .get(tcb.stream)
            .map(|p| p.name())
            .unwrap_or("unknown");
        self.reporter.report(
            now_secs,
            tcb.ip_remote,
            tcb.port_remote,
            stream_name,
            tcb.ttl,
            &tcb.banner,
        );

        tcb.reset();
        trace!("tcb: destroy {key:?} reason={reason:?}");

        self.generations[key.index()] = self.generations[key.index()].wrapping_add(1);
        self.free_list.push(key.index() as u32);
        self.active_count -= 1;
    }

    /// Pop one timer hint due at or before `now`, validated against each
    /// TCB's own recorded tick (`crate::timer::TimerWheel::remove_expired`).
    /// Kept here rather than written inline at each call site because it
    /// needs `self.timer` mutably borrowed at the same time as
    /// `self.slots`/`self.generations` immutably — the same disjoint-field
    /// trick as `tcb_and_parser`.
    pub fn remove_expired_timer(&mut self, now: Tick) -> Option<TcbKey> {
        let generations = &self.generations;
        let slots = &self.slots;
        self.timer.remove_expired(now, |key| {
            if generations.get(key.index()).copied() != Some(key.generation()) {
                return None;
            }
            slots[key.index()].as_ref().and_then(|t| t.timer_tick)
        })
    }

    /// Destroy every live TCB, flushing banners, then drop the arena
    /// (`SPEC_FULL.md` §4.D `destroy_table`). Used on engine shutdown.
    pub fn destroy_all(&mut self, now_secs: u64) {
        let keys: Vec<TcbKey> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| TcbKey::new(i as u32, self.generations[i])))
            .collect();
        for key in keys {
            self.destroy(key, DestroyReason::Shutdown, now_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BufferReporter;
    use std::net::Ipv4Addr;

    fn ranges() -> ReconnectRanges {
        use crate::rangeaddr::{Ipv4Range, Ipv6Range, PortRange};
        ReconnectRanges {
            ipv4: Ipv4Range::single(Ipv4Addr::new(10, 0, 0, 1)),
            ipv6: Ipv6Range::single(std::net::Ipv6Addr::UNSPECIFIED),
            ports: PortRange::single(40000),
        }
    }

    fn new_table() -> Table {
        Table::new(1 << 10, 0xCAFE, 30, 2, ranges(), Box::new(BufferReporter::default()))
    }

    #[test]
    fn create_is_idempotent() {
        let mut t = new_table();
        let local = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let a = t.create(local, remote, 40000, 80, 1000, 5000, 64, 0, 0);
        let b = t.create(local, remote, 40000, 80, 9999, 9999, 64, 0, 0);
        assert_eq!(a, b);
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn lookup_is_symmetric_bucket() {
        let t = new_table();
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(t.bucket_of(a, b, 1, 2), t.bucket_of(b, a, 2, 1));
    }

    #[test]
    fn destroy_then_create_reuses_slot_with_new_generation() {
        let mut t = new_table();
        let local = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let key1 = t.create(local, remote, 40000, 80, 1000, 5000, 64, 0, 0);
        t.destroy(key1, DestroyReason::Reset, 0);
        assert_eq!(t.active_count(), 0);
        assert!(t.get(key1).is_none());

        let key2 = t.create(local, remote, 40000, 81, 1000, 5000, 64, 0, 0);
        assert_eq!(key2.index(), key1.index());
        assert_ne!(key2.generation(), key1.generation());
    }

    #[test]
    fn double_destroy_is_a_noop() {
        let mut t = new_table();
        let local = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let key = t.create(local, remote, 40000, 80, 1000, 5000, 64, 0, 0);
        t.destroy(key, DestroyReason::Reset, 0);
        t.destroy(key, DestroyReason::Reset, 0); // must not panic or double-count
        assert_eq!(t.active_count(), 0);
    }
}
