/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The certification engine: optimistic conflict detection over the totally-ordered
//! write-set stream.
//!
//! Certification runs in strict seqno order, on one thread. For a write-set at seqno
//! `s` with snapshot horizon `last_seen`, each key is checked against the index of
//! recently certified accesses: a conflicting access certified after `last_seen` but
//! before `s` rejects the write-set (first committer wins). Shared (reference) accesses
//! conflict with nothing but exclusive accesses; exclusive accesses conflict with
//! everything.
//!
//! The index is bounded by a trailing window below `last_committed`, which advances as
//! commit cuts arrive. A certified write-set also learns its `depends_seqno`: the
//! newest certified access it read past, which is the lower bound appliers must reach
//! before applying it in parallel.

use std::collections::{BTreeMap, HashMap};

use crate::types::basic::Seqno;
use crate::types::writeset::{KeyFingerprint, WriteSet};

#[derive(Clone, Debug)]
pub struct CertConfig {
    /// How many seqnos below `last_committed` certified accesses are retained.
    pub trailing_window: i64,
    /// Log every conflict (cert.log_conflicts).
    pub log_conflicts: bool,
}

impl Default for CertConfig {
    fn default() -> Self {
        CertConfig {
            trailing_window: 16 * 1024,
            log_conflicts: false,
        }
    }
}

/// Outcome of certifying one write-set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertResult {
    /// No conflict. `depends_seqno` is the newest certified access any of the
    /// write-set's keys collided with benignly; apply must wait for it to commit.
    Certified { depends_seqno: Seqno },
    /// A conflicting access was certified inside the snapshot gap. The originator gets
    /// a certification failure; everyone else skips the write-set.
    Rejected,
}

/// Last certified accesses for one key fingerprint.
struct KeyEntry {
    /// Newest access of any kind.
    last_any: Seqno,
    /// Newest exclusive access.
    last_full: Seqno,
}

pub struct Certifier {
    config: CertConfig,
    index: HashMap<KeyFingerprint, KeyEntry>,
    /// Certified write-sets not yet below `last_committed`: seqno → its fingerprints.
    in_flight: BTreeMap<Seqno, Vec<KeyFingerprint>>,
    /// The last seqno fed through certification.
    position: Seqno,
    last_committed: Seqno,
}

impl Certifier {
    pub fn new(config: CertConfig) -> Certifier {
        Certifier {
            config,
            index: HashMap::new(),
            in_flight: BTreeMap::new(),
            position: Seqno::NONE,
            last_committed: Seqno::NONE,
        }
    }

    pub fn position(&self) -> Seqno {
        self.position
    }

    pub fn last_committed(&self) -> Seqno {
        self.last_committed
    }

    /// Certify the write-set ordered at `seqno`. Must be called in ascending seqno
    /// order; a regression means the total order broke, which is unrecoverable.
    pub fn certify(&mut self, seqno: Seqno, ws: &WriteSet) -> CertResult {
        assert!(
            seqno > self.position,
            "certification order regressed: {} after {}",
            seqno,
            self.position
        );
        self.position = seqno;

        if ws.is_commutative() {
            // Commutative write-sets neither conflict nor register accesses.
            return CertResult::Certified {
                depends_seqno: self.last_committed,
            };
        }

        let mut depends_seqno = Seqno::NONE;
        for key in &ws.keys {
            let fingerprint = key.fingerprint();
            if let Some(entry) = self.index.get(&fingerprint) {
                let blocking = if key.full_match {
                    entry.last_any
                } else {
                    entry.last_full
                };
                if blocking > ws.last_seen {
                    if self.config.log_conflicts {
                        log::info!(
                            "cert: conflict at {}: key certified at {} is past horizon {} (trx {} of {})",
                            seqno,
                            blocking,
                            ws.last_seen,
                            ws.trx_id,
                            ws.source
                        );
                    }
                    return CertResult::Rejected;
                }
                depends_seqno = depends_seqno.max(blocking);
            }
        }

        let mut fingerprints = Vec::with_capacity(ws.keys.len());
        for key in &ws.keys {
            let fingerprint = key.fingerprint();
            let entry = self.index.entry(fingerprint).or_insert(KeyEntry {
                last_any: Seqno::NONE,
                last_full: Seqno::NONE,
            });
            entry.last_any = entry.last_any.max(seqno);
            if key.full_match {
                entry.last_full = entry.last_full.max(seqno);
            }
            fingerprints.push(fingerprint);
        }
        self.in_flight.insert(seqno, fingerprints);

        CertResult::Certified { depends_seqno }
    }

    /// Jump the certification position forward without certifying, after installing a
    /// state snapshot consistent at `seqno`.
    pub fn fast_forward(&mut self, seqno: Seqno) {
        assert!(
            seqno >= self.position,
            "fast-forward would regress certification from {} to {}",
            self.position,
            seqno
        );
        self.position = seqno;
        if seqno > self.last_committed {
            self.last_committed = seqno;
        }
    }

    /// Advance the commit horizon and purge what fell out of the trailing window.
    pub fn set_last_committed(&mut self, last_committed: Seqno) {
        if last_committed <= self.last_committed {
            return;
        }
        self.last_committed = last_committed;

        let horizon = last_committed - self.config.trailing_window;
        if horizon <= Seqno::new(0) {
            // Nothing old enough to purge yet; still drop committed in-flight records.
            self.purge_in_flight(last_committed);
            return;
        }
        self.index.retain(|_, entry| entry.last_any >= horizon);
        self.purge_in_flight(last_committed);
    }

    fn purge_in_flight(&mut self, last_committed: Seqno) {
        self.in_flight = self.in_flight.split_off(&last_committed);
    }

    /// Number of keys currently indexed. Used by tests and diagnostics.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{MemberId, TrxId};
    use crate::types::writeset::{WsFlags, WsKey};

    fn writeset(source: MemberId, last_seen: i64, keys: Vec<WsKey>) -> WriteSet {
        WriteSet {
            source,
            trx_id: TrxId::new(1),
            last_seen: Seqno::new(last_seen),
            keys,
            data: Vec::new(),
            flags: WsFlags::COMMIT,
        }
    }

    fn key(name: &[u8]) -> WsKey {
        WsKey::exclusive(vec![name.to_vec()])
    }

    fn shared_key(name: &[u8]) -> WsKey {
        WsKey::shared(vec![name.to_vec()])
    }

    #[test]
    fn first_committer_wins() {
        let a = MemberId::generate();
        let b = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());

        // Both transactions read the same snapshot (last_seen = 0) and write k1.
        let ws1 = writeset(a, 0, vec![key(b"k1")]);
        let ws2 = writeset(b, 0, vec![key(b"k1")]);

        assert!(matches!(
            cert.certify(Seqno::new(1), &ws1),
            CertResult::Certified { .. }
        ));
        assert_eq!(cert.certify(Seqno::new(2), &ws2), CertResult::Rejected);
    }

    #[test]
    fn non_overlapping_keys_both_certify() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());
        assert!(matches!(
            cert.certify(Seqno::new(1), &writeset(a, 0, vec![key(b"k1")])),
            CertResult::Certified { .. }
        ));
        assert!(matches!(
            cert.certify(Seqno::new(2), &writeset(a, 0, vec![key(b"k2")])),
            CertResult::Certified { .. }
        ));
    }

    #[test]
    fn later_snapshot_sees_the_earlier_write() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(1), &writeset(a, 0, vec![key(b"k1")]));

        // This transaction's snapshot includes seqno 1, so no conflict; but it depends
        // on 1 for apply ordering.
        let result = cert.certify(Seqno::new(2), &writeset(a, 1, vec![key(b"k1")]));
        assert_eq!(
            result,
            CertResult::Certified {
                depends_seqno: Seqno::new(1)
            }
        );
    }

    #[test]
    fn shared_accesses_do_not_conflict_with_each_other() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(1), &writeset(a, 0, vec![shared_key(b"k1")]));
        let result = cert.certify(Seqno::new(2), &writeset(a, 0, vec![shared_key(b"k1")]));
        assert!(matches!(result, CertResult::Certified { .. }));
    }

    #[test]
    fn exclusive_conflicts_with_prior_shared_and_vice_versa() {
        let a = MemberId::generate();

        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(1), &writeset(a, 0, vec![shared_key(b"k1")]));
        assert_eq!(
            cert.certify(Seqno::new(2), &writeset(a, 0, vec![key(b"k1")])),
            CertResult::Rejected
        );

        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(1), &writeset(a, 0, vec![key(b"k1")]));
        assert_eq!(
            cert.certify(Seqno::new(2), &writeset(a, 0, vec![shared_key(b"k1")])),
            CertResult::Rejected
        );
    }

    #[test]
    fn commutative_writesets_skip_certification() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(1), &writeset(a, 0, vec![key(b"k1")]));

        let mut commutative = writeset(a, 0, vec![key(b"k1")]);
        commutative.flags = WsFlags::COMMIT.union(WsFlags::COMMUTATIVE);
        assert!(matches!(
            cert.certify(Seqno::new(2), &commutative),
            CertResult::Certified { .. }
        ));
        // And it registered nothing: a later exclusive from the same snapshot only
        // conflicts with seqno 1.
        let result = cert.certify(Seqno::new(3), &writeset(a, 1, vec![key(b"k1")]));
        assert!(matches!(result, CertResult::Certified { .. }));
    }

    #[test]
    fn purge_drops_entries_below_the_trailing_window() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig {
            trailing_window: 2,
            log_conflicts: false,
        });
        for int in 1..=6 {
            let name = vec![int as u8];
            let result = cert.certify(
                Seqno::new(int),
                &writeset(a, int - 1, vec![key(&name)]),
            );
            assert!(matches!(result, CertResult::Certified { .. }));
        }
        assert_eq!(cert.index_len(), 6);
        assert_eq!(cert.in_flight_len(), 6);

        cert.set_last_committed(Seqno::new(6));
        // Entries with seqno < 6 - 2 = 4 are gone; in-flight below 6 is gone.
        assert_eq!(cert.index_len(), 3);
        assert_eq!(cert.in_flight_len(), 1);
    }

    #[test]
    fn certification_order_regression_is_fatal() {
        let a = MemberId::generate();
        let mut cert = Certifier::new(CertConfig::default());
        cert.certify(Seqno::new(5), &writeset(a, 0, vec![key(b"k1")]));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cert.certify(Seqno::new(4), &writeset(a, 0, vec![key(b"k2")]))
        }));
        assert!(result.is_err());
    }
}
