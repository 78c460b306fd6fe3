use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

/// Transaction ids of the form `m{millis}.{counter}.{salt}`.
///
/// The counter is per instance and the salt is random per instance, so two
/// clients in one process never hand out the same id.
#[derive(Debug)]
pub struct TxnIdGenerator {
    counter: AtomicU64,
    salt: String,
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnIdGenerator {
    pub fn new() -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        Self {
            counter: AtomicU64::new(0),
            salt: salt[..8].to_owned(),
        }
    }

    pub fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        format!("m{millis}.{counter}.{}", self.salt)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_unique_and_well_formed() {
        let generator = TxnIdGenerator::new();
        let ids: HashSet<_> = (0..100).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 100);

        let id = generator.next_id();
        let parts: Vec<_> = id.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with('m'));
        assert_eq!(parts[1], "100");
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn separate_generators_use_different_salts() {
        let a = TxnIdGenerator::new().next_id();
        let b = TxnIdGenerator::new().next_id();
        assert_ne!(a.rsplit('.').next(), b.rsplit('.').next());
    }
}
