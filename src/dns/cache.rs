use std::net::IpAddr;
use std::time::{Duration, Instant};

/// One resolved address, as handed back through a [`super::DnsCallback`].
#[derive(Clone, Debug)]
pub struct DnsRecord {
    pub name: String,
    pub ip: IpAddr,
    pub ttl: u32,
    pub received_at: Instant,
}

impl DnsRecord {
    /// TTL-doubling staleness rule (spec §4.10): a record is still usable
    /// for up to twice its advertised TTL past receipt, not just once.
    pub fn is_out_of_date(&self) -> bool {
        self.received_at.elapsed() > Duration::from_secs((self.ttl as u64).saturating_mul(2))
    }
}

/// Per-name cache bookkeeping: the records themselves plus the counters
/// the circuit breaker and sweep timer both read.
pub(crate) struct CacheEntry {
    records: Vec<DnsRecord>,
    stamp: Instant,
    try_msg: u32,
    fail_msg: u32,
}

impl CacheEntry {
    pub(crate) fn new() -> CacheEntry {
        CacheEntry {
            records: Vec::new(),
            stamp: Instant::now(),
            try_msg: 0,
            fail_msg: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.stamp = Instant::now();
    }

    pub(crate) fn add_records(&mut self, records: Vec<DnsRecord>) {
        self.records = records;
        self.stamp = Instant::now();
    }

    pub(crate) fn fresh_records(&self) -> Vec<DnsRecord> {
        self.records.iter().filter(|r| !r.is_out_of_date()).cloned().collect()
    }

    pub(crate) fn record_try(&mut self) {
        self.try_msg += 1;
    }

    /// A fresh success forgives the entry's failure history rather than
    /// letting one stale 95%-failure streak haunt it forever.
    pub(crate) fn record_succ(&mut self) {
        self.try_msg = 0;
        self.fail_msg = 0;
    }

    pub(crate) fn record_fail(&mut self) {
        self.fail_msg += 1;
    }

    /// ≥16 attempts and a ≥95% failure rate trips the breaker (spec
    /// §4.10): further queries for the name short-circuit to a failure
    /// rather than hammering an unreachable nameserver.
    pub(crate) fn circuit_open(&self) -> bool {
        self.try_msg >= 16 && self.fail_msg.saturating_mul(100) / self.try_msg.max(1) >= 95
    }

    pub(crate) fn is_idle_past(&self, secs: u64) -> bool {
        self.stamp.elapsed() > Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_survives_within_double_ttl() {
        let record = DnsRecord {
            name: "example.com".into(),
            ip: "127.0.0.1".parse().unwrap(),
            ttl: 3600,
            received_at: Instant::now(),
        };
        assert!(!record.is_out_of_date());
    }

    #[test]
    fn zero_ttl_record_is_immediately_out_of_date() {
        let record = DnsRecord {
            name: "example.com".into(),
            ip: "127.0.0.1".parse().unwrap(),
            ttl: 0,
            received_at: Instant::now() - Duration::from_millis(5),
        };
        assert!(record.is_out_of_date());
    }

    #[test]
    fn circuit_trips_past_threshold() {
        let mut entry = CacheEntry::new();
        for _ in 0..20 {
            entry.record_try();
            entry.record_fail();
        }
        assert!(entry.circuit_open());
    }

    #[test]
    fn circuit_stays_closed_under_sixteen_tries() {
        let mut entry = CacheEntry::new();
        for _ in 0..10 {
            entry.record_try();
            entry.record_fail();
        }
        assert!(!entry.circuit_open());
    }

    #[test]
    fn success_resets_failure_history() {
        let mut entry = CacheEntry::new();
        for _ in 0..20 {
            entry.record_try();
            entry.record_fail();
        }
        entry.record_try();
        entry.record_succ();
        assert!(!entry.circuit_open());
    }
}
