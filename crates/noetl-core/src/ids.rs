//! Time-sortable snowflake identifiers.
//!
//! Execution, event, and command ids are 64-bit integers laid out as
//! 41 bits of milliseconds since a fixed epoch, 10 bits of node id, and
//! 12 bits of per-millisecond sequence. Ids generated by one node are
//! strictly monotonic; ids from different nodes sort by wall clock.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z, in unix milliseconds.
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_NODE: u64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Generator for snowflake-style i64 identifiers.
///
/// Thread-safe; a single instance is shared per process.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: u64,
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: u64,
    sequence: u64,
}

impl SnowflakeGenerator {
    /// Create a generator for the given node id (masked to 10 bits).
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & MAX_NODE,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Allocate the next identifier.
    ///
    /// Spins into the next millisecond if the 12-bit sequence for the
    /// current one is exhausted, so ids from one generator never collide.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("snowflake state poisoned");
        let mut now = current_millis();

        if now < state.last_ms {
            // Clock went backwards; hold the line at the last seen tick.
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while current_millis() <= state.last_ms {
                    std::hint::spin_loop();
                }
                now = current_millis();
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        let ts = now.saturating_sub(EPOCH_MS);
        ((ts << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence)
            as i64
    }

    /// Extract the unix-millisecond timestamp embedded in an id.
    pub fn timestamp_ms(id: i64) -> u64 {
        ((id as u64) >> (NODE_BITS + SEQUENCE_BITS)) + EPOCH_MS
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Content hash used for catalog stability checks (sha-256, hex-encoded).
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let gen = SnowflakeGenerator::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last, "ids must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn test_ids_embed_timestamp() {
        let gen = SnowflakeGenerator::new(7);
        let before = current_millis();
        let id = gen.next_id();
        let after = current_millis();

        let ts = SnowflakeGenerator::timestamp_ms(id);
        assert!(ts >= before && ts <= after + 1);
    }

    #[test]
    fn test_node_id_masked() {
        // Node ids beyond 10 bits must not corrupt the timestamp.
        let gen = SnowflakeGenerator::new(u16::MAX);
        let id = gen.next_id();
        let ts = SnowflakeGenerator::timestamp_ms(id);
        assert!(ts >= EPOCH_MS);
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash("workload: {}\n");
        let b = content_hash("workload: {}\n");
        let c = content_hash("workload: {x: 1}\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
