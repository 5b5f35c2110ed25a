use sha2::{Digest, Sha256};

use crate::metrics::METRIC_CONTENTION_RESOLUTIONS;

/// Virtual tokens placed on the ring for each bidder. Higher counts smooth
/// the win distribution across state hashes.
const VIRTUAL_TOKENS: usize = 500;

/// Deterministically picks the coordinator for a contested state.
///
/// Both nodes in a contention run this locally with the same inputs and
/// must arrive at the same winner without exchanging further messages. Each
/// bidder id contributes [`VIRTUAL_TOKENS`] points on a hash ring; the
/// state hash is hashed onto the ring and the owner of the next token
/// clockwise wins. If two tokens land on the same ring point, the
/// lexicographically smaller bidder id owns the point.
pub fn resolve(state_hash: &str, bidder_a: &str, bidder_b: &str) -> String {
    let mut best: Option<(u64, &str)> = None;
    let target = ring_point(state_hash.as_bytes());

    for bidder in [bidder_a, bidder_b] {
        for i in 0..VIRTUAL_TOKENS {
            let token = format!("{bidder}{i}");
            let point = ring_point(token.as_bytes());
            // clockwise distance from the target, wrapping at u64::MAX
            let distance = point.wrapping_sub(target);
            let better = match best {
                None => true,
                Some((best_distance, best_bidder)) => {
                    distance < best_distance || (distance == best_distance && bidder < best_bidder)
                }
            };
            if better {
                best = Some((distance, bidder));
            }
        }
    }

    metrics::counter!(METRIC_CONTENTION_RESOLUTIONS, 1);
    best.map(|(_, bidder)| bidder.to_string())
        .unwrap_or_default()
}

fn ring_point(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let first = resolve("0x0000000000000000000000000000000000000000000000000000000000000001",
            "bid-A", "bid-B");
        for _ in 0..10_000 {
            let winner = resolve(
                "0x0000000000000000000000000000000000000000000000000000000000000001",
                "bid-A",
                "bid-B",
            );
            assert_eq!(winner, first);
        }
    }

    #[test]
    fn symmetric_in_bidder_order() {
        for seed in 0..100u32 {
            let state = format!("0x{seed:064x}");
            let forward = resolve(&state, "node-alpha", "node-beta");
            let reverse = resolve(&state, "node-beta", "node-alpha");
            assert_eq!(forward, reverse, "winner must not depend on argument order");
        }
    }

    #[test]
    fn roughly_fair_over_many_states() {
        let mut wins_a = 0usize;
        let total = 2_000usize;
        for seed in 0..total {
            let state = format!("0x{seed:064x}");
            if resolve(&state, "bidder-one", "bidder-two") == "bidder-one" {
                wins_a += 1;
            }
        }
        // With 500 tokens per side either bidder should take a substantial
        // share of wins; a grossly skewed split indicates a broken ring.
        assert!(wins_a > total / 4, "bidder-one won only {wins_a}/{total}");
        assert!(wins_a < total * 3 / 4, "bidder-one won {wins_a}/{total}");
    }

    #[test]
    fn distinct_bidders_required_for_meaningful_result() {
        let winner = resolve("0xabc", "same", "same");
        assert_eq!(winner, "same");
    }
}
