//! Endpoint table: per-remote-candidate RTT history, classification,
//! and ping bookkeeping (spec §3, §4.3). Grounded on
//! `original_source/.../Endpoint.h/.cpp`.

use crate::buffers::HistoricBuffer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Ping rounds at which the probe loop evaluates whether to switch the
/// preferred endpoint (spec §4.3): an early look at round 4, then a
/// settled look at round 10 once RTT history has stabilized.
pub const UDP_PING_EVAL_ROUNDS: &[u32] = &[4, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    UdpP2pInet,
    UdpP2pLan,
    UdpRelay,
    TcpRelay,
}

impl EndpointType {
    pub fn is_p2p(self) -> bool {
        matches!(self, EndpointType::UdpP2pInet | EndpointType::UdpP2pLan)
    }

    pub fn is_relay(self) -> bool {
        matches!(self, EndpointType::UdpRelay | EndpointType::TcpRelay)
    }
}

/// A single candidate path to the remote peer (spec §4.3 "endpoint
/// table": one per UDP P2P/LAN/relay candidate and one per TCP
/// relay).
pub struct Endpoint {
    pub id: i64,
    pub address: Option<SocketAddr>,
    pub v6_address: Option<SocketAddr>,
    pub endpoint_type: EndpointType,
    pub peer_tag: [u8; 16],

    rtts: HistoricBuffer<f64>,
    self_rtts: HistoricBuffer<f64>,
    udp_ping_times: HashMap<u32, Instant>,

    average_rtt: f64,
    last_ping_time: Option<Instant>,
    last_ping_seq: u32,
    udp_pong_count: u32,
    total_udp_pings: u32,
    total_udp_ping_replies: u32,
}

impl Endpoint {
    pub fn new(id: i64, endpoint_type: EndpointType, peer_tag: [u8; 16]) -> Self {
        Self {
            id,
            address: None,
            v6_address: None,
            endpoint_type,
            peer_tag,
            rtts: HistoricBuffer::new(6),
            self_rtts: HistoricBuffer::new(4),
            udp_ping_times: HashMap::new(),
            average_rtt: 0.0,
            last_ping_time: None,
            last_ping_seq: 0,
            udp_pong_count: 0,
            total_udp_pings: 0,
            total_udp_ping_replies: 0,
        }
    }

    pub fn is_ipv6_only(&self) -> bool {
        self.address.is_none() && self.v6_address.is_some()
    }

    /// `CleanID` masks off the high bit the original uses to flag
    /// "has a peer tag" in the 64-bit endpoint identifier.
    pub fn clean_id(&self) -> i64 {
        self.id & !(1i64 << 63)
    }

    pub fn start_udp_ping(&mut self, seq: u32, now: Instant) {
        self.last_ping_seq = seq;
        self.last_ping_time = Some(now);
        self.udp_ping_times.insert(seq, now);
        self.total_udp_pings += 1;
    }

    /// Records a pong, updating the RTT history. Returns the measured
    /// RTT if the matching ping was still tracked.
    pub fn record_pong(&mut self, seq: u32, now: Instant) -> Option<f64> {
        let sent_at = self.udp_ping_times.remove(&seq)?;
        let rtt = now.saturating_duration_since(sent_at).as_secs_f64();
        self.rtts.add(rtt);
        self.average_rtt = self.rtts.non_zero_average();
        self.udp_pong_count += 1;
        self.total_udp_ping_replies += 1;
        Some(rtt)
    }

    pub fn record_self_rtt(&mut self, rtt: f64) {
        self.self_rtts.add(rtt);
    }

    pub fn average_rtt(&self) -> f64 {
        self.average_rtt
    }

    pub fn average_self_rtt(&self) -> f64 {
        self.self_rtts.non_zero_average()
    }

    pub fn ping_reply_ratio(&self) -> f64 {
        if self.total_udp_pings == 0 {
            0.0
        } else {
            self.total_udp_ping_replies as f64 / self.total_udp_pings as f64
        }
    }
}

/// The controller's set of candidate endpoints, keyed by id, plus the
/// currently-preferred one (spec §4.3 "relay selection with
/// hysteresis").
pub struct EndpointTable {
    endpoints: HashMap<i64, Endpoint>,
    preferred: Option<i64>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self { endpoints: HashMap::new(), preferred: None }
    }

    pub fn insert(&mut self, endpoint: Endpoint) {
        let id = endpoint.id;
        self.endpoints.insert(id, endpoint);
        if self.preferred.is_none() {
            self.preferred = Some(id);
        }
    }

    pub fn get(&self, id: i64) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    pub fn preferred(&self) -> Option<&Endpoint> {
        self.preferred.and_then(|id| self.endpoints.get(&id))
    }

    /// Switches the preferred endpoint to `candidate_id` only if its
    /// average RTT beats the current preferred endpoint's by more than
    /// `threshold` (a multiplicative hysteresis factor from server
    /// config, spec §4.3), preventing flapping between near-equal
    /// paths.
    pub fn maybe_switch_preferred(&mut self, candidate_id: i64, threshold: f64) -> bool {
        let candidate_rtt = match self.endpoints.get(&candidate_id) {
            Some(e) => e.average_rtt(),
            None => return false,
        };

        let should_switch = match self.preferred() {
            None => true,
            Some(current) if current.id == candidate_id => false,
            Some(current) => {
                let current_rtt = current.average_rtt();
                current_rtt <= 0.0 || candidate_rtt > 0.0 && candidate_rtt * threshold < current_rtt
            }
        };

        if should_switch {
            self.preferred = Some(candidate_id);
        }
        should_switch
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn eval_rounds_are_four_and_ten() {
        assert_eq!(UDP_PING_EVAL_ROUNDS, &[4, 10]);
    }

    #[test]
    fn pong_updates_average_rtt() {
        let mut ep = Endpoint::new(1, EndpointType::UdpP2pInet, [0u8; 16]);
        let t0 = Instant::now();
        ep.start_udp_ping(1, t0);
        let rtt = ep.record_pong(1, t0 + Duration::from_millis(40)).unwrap();
        assert!((rtt - 0.04).abs() < 0.001);
        assert!(ep.average_rtt() > 0.0);
    }

    #[test]
    fn unmatched_pong_is_ignored() {
        let mut ep = Endpoint::new(1, EndpointType::UdpP2pInet, [0u8; 16]);
        assert!(ep.record_pong(99, Instant::now()).is_none());
    }

    #[test]
    fn preferred_switches_only_past_hysteresis_threshold() {
        let mut table = EndpointTable::new();
        let mut relay = Endpoint::new(1, EndpointType::UdpRelay, [0u8; 16]);
        let mut p2p = Endpoint::new(2, EndpointType::UdpP2pInet, [0u8; 16]);

        let t0 = Instant::now();
        relay.start_udp_ping(1, t0);
        relay.record_pong(1, t0 + Duration::from_millis(100));
        p2p.start_udp_ping(1, t0);
        p2p.record_pong(1, t0 + Duration::from_millis(95));

        table.insert(relay);
        table.insert(p2p);
        table.preferred = Some(1);

        // 95ms isn't enough of an improvement over 100ms at threshold 0.8.
        assert!(!table.maybe_switch_preferred(2, 0.8));

        if let Some(p2p) = table.get_mut(2) {
            p2p.record_pong(2, t0); // no-op, seq doesn't match, RTT unchanged
        }
        // A much faster candidate (well past threshold) does switch.
        let mut fast = Endpoint::new(3, EndpointType::UdpP2pLan, [0u8; 16]);
        fast.start_udp_ping(1, t0);
        fast.record_pong(1, t0 + Duration::from_millis(5));
        table.insert(fast);
        assert!(table.maybe_switch_preferred(3, 0.8));
        assert_eq!(table.preferred().unwrap().id, 3);
    }
}
