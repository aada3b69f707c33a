//! The per-transaction envelope and its reuse pool (§3 Envelope, §4.C).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::protocol::Address;

/// Monotonically increasing id, unique within a connection.
pub type TransactionId = u64;

/// Holds per-transaction SMTP state. Mutated only by the connection task
/// that owns it (§5 Envelope ownership) — no internal synchronization.
#[derive(Debug, Default, Clone)]
pub struct Envelope {
    pub remote_ip: String,
    pub helo: String,
    pub tls: bool,
    pub id: TransactionId,
    pub queued_id: String,
    pub mail_from: Option<Address>,
    pub rcpt_to: Vec<Address>,
    pub data: Vec<u8>,
    pub header: HashMap<String, Vec<String>>,
}

/// Upper bound on recipients per transaction (§3 invariant 2).
pub const MAX_RECIPIENTS: usize = 100;

impl Envelope {
    /// `true` once `MAIL FROM` has been accepted for the current
    /// transaction, including the null-path case — per §9's open question,
    /// `is_in_transaction` deliberately treats a null reverse-path as "in
    /// transaction" since the client has still opened one.
    pub fn is_in_transaction(&self) -> bool {
        self.mail_from.is_some()
    }

    /// Resets everything specific to the current mail transaction, leaving
    /// connection-scoped fields (`helo`, `remote_ip`, `tls`) intact (§3
    /// invariant).
    pub fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data.clear();
        self.header.clear();
    }

    /// Clears everything, including connection-scoped fields, for return to
    /// the pool (§3 invariant 5, §8 property 2).
    fn clear_for_return(&mut self) {
        self.remote_ip.clear();
        self.helo.clear();
        self.tls = false;
        self.id = 0;
        self.queued_id.clear();
        self.reset_transaction();
    }

    /// Re-initializes a pooled envelope for a freshly accepted connection.
    fn init(&mut self, remote_ip: String) {
        self.clear_for_return();
        self.remote_ip = remote_ip;
    }
}

/// Reusable envelopes keyed by connection acquire/release (§4.C). Avoids a
/// per-message allocation in the hot path by recycling `Envelope` buffers
/// (`data`, `header`) across connections instead of dropping them.
#[derive(Default)]
pub struct EnvelopePool {
    free: Mutex<Vec<Box<Envelope>>>,
    next_queued_id: AtomicU64,
}

impl EnvelopePool {
    pub fn new() -> Self {
        EnvelopePool {
            free: Mutex::new(Vec::new()),
            next_queued_id: AtomicU64::new(1),
        }
    }

    /// Borrows an envelope for a newly accepted connection, reusing a
    /// cached one if available.
    pub fn borrow(&self, remote_ip: String) -> Box<Envelope> {
        let mut envelope = {
            let mut free = self.free.lock().expect("envelope pool mutex poisoned");
            free.pop().unwrap_or_default()
        };
        envelope.init(remote_ip);
        envelope
    }

    /// Returns an envelope to the pool, clearing all transaction state
    /// first (§3 invariant 5).
    pub fn release(&self, mut envelope: Box<Envelope>) {
        envelope.clear_for_return();
        let mut free = self.free.lock().expect("envelope pool mutex poisoned");
        free.push(envelope);
    }

    /// A stable, externally visible id distinct from the per-connection
    /// transaction counter.
    pub fn next_queued_id(&self) -> String {
        let n = self.next_queued_id.fetch_add(1, Ordering::Relaxed);
        format!("{n:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_transaction_clears_transaction_fields_only() {
        let mut envelope = Envelope {
            remote_ip: "1.2.3.4".to_string(),
            helo: "client.example.com".to_string(),
            tls: true,
            ..Default::default()
        };
        envelope.mail_from = Some(Address::default());
        envelope.rcpt_to.push(Address::default());
        envelope.data.extend_from_slice(b"hello");
        envelope.header.insert("Subject".to_string(), vec!["x".to_string()]);

        envelope.reset_transaction();

        assert_eq!(envelope.remote_ip, "1.2.3.4");
        assert_eq!(envelope.helo, "client.example.com");
        assert!(envelope.tls);
        assert!(envelope.mail_from.is_none());
        assert!(envelope.rcpt_to.is_empty());
        assert!(envelope.data.is_empty());
        assert!(envelope.header.is_empty());
    }

    #[test]
    fn is_in_transaction_true_for_null_path() {
        let mut envelope = Envelope::default();
        envelope.mail_from = Some(Address {
            null_path: true,
            ..Default::default()
        });
        assert!(envelope.is_in_transaction());
    }

    #[test]
    fn borrowed_envelope_has_transaction_fields_cleared() {
        let pool = EnvelopePool::new();
        let mut envelope = pool.borrow("10.0.0.1".to_string());
        envelope.mail_from = Some(Address::default());
        envelope.data.extend_from_slice(b"payload");
        pool.release(envelope);

        let envelope = pool.borrow("10.0.0.2".to_string());
        assert_eq!(envelope.remote_ip, "10.0.0.2");
        assert!(envelope.mail_from.is_none());
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn queued_ids_are_unique_and_monotonic() {
        let pool = EnvelopePool::new();
        let a = pool.next_queued_id();
        let b = pool.next_queued_id();
        assert_ne!(a, b);
    }
}
