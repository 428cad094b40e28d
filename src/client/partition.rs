//! Deterministic parameter placement.
//!
//! Every client and server must agree on which shard owns a parameter, so
//! placement depends only on the parameter name and the shard count.

use sha3::{Digest, Sha3_256};

/// Seedless 64-bit hash of a parameter name.
///
/// The first eight bytes of SHA3-256, little endian. Stable across runs,
/// processes and platforms.
pub fn stable_hash(name: &str) -> u64 {
    let digest = Sha3_256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Shard index owning `name` in a fleet of `server_count` servers.
///
/// # Panics
///
/// Panics if `server_count` is zero.
pub fn shard(name: &str, server_count: usize) -> usize {
    assert!(server_count > 0, "shard count must be positive");
    (stable_hash(name) % server_count as u64) as usize
}

/// Group items by owning shard.
///
/// Bucket `i` holds the items owned by shard `i`, each paired with its
/// position in the input, in input order.
pub fn partition_by_shard<T, F>(items: Vec<T>, server_count: usize, name_of: F) -> Vec<Vec<(usize, T)>>
where
    F: Fn(&T) -> &str,
{
    let mut buckets: Vec<Vec<(usize, T)>> = (0..server_count).map(|_| Vec::new()).collect();
    for (position, item) in items.into_iter().enumerate() {
        let index = shard(name_of(&item), server_count);
        buckets[index].push((position, item));
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    #[test]
    fn test_stable_hash_is_fixed() {
        // Pinned so that a placement change is caught before it splits a fleet.
        assert_eq!(stable_hash("p_0"), 15037793774608322612);
        assert_eq!(stable_hash("p_1"), 12563185469996817780);
        assert_eq!(stable_hash("weight"), 13297768865601189332);
    }

    #[test]
    fn test_shard_deterministic_for_random_names() {
        let mut rng = thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(1..32);
            let name: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            let count = rng.gen_range(1..64);

            let first = shard(&name, count);
            assert!(first < count);
            for _ in 0..4 {
                assert_eq!(shard(&name, count), first);
            }
        }
    }

    #[test]
    fn test_single_server_owns_everything() {
        for i in 0..50 {
            assert_eq!(shard(&format!("p_{}", i), 1), 0);
        }
    }

    #[test]
    fn test_spreads_across_fleet() {
        let mut used = [false; 10];
        for i in 0..100 {
            used[shard(&format!("p_{}", i), 10)] = true;
        }
        assert!(used.iter().filter(|u| **u).count() >= 8);
    }

    #[test]
    #[should_panic]
    fn test_zero_servers_panics() {
        shard("p_0", 0);
    }

    #[test]
    fn test_partition_keeps_positions() {
        let names: Vec<String> = (0..30).map(|i| format!("p_{}", i)).collect();
        let buckets = partition_by_shard(names.clone(), 4, |n| n.as_str());

        assert_eq!(buckets.len(), 4);
        let mut seen = 0;
        for (index, bucket) in buckets.iter().enumerate() {
            let mut last = None;
            for (position, name) in bucket {
                assert_eq!(&names[*position], name);
                assert_eq!(shard(name, 4), index);
                assert!(last.map_or(true, |l| l < *position));
                last = Some(*position);
                seen += 1;
            }
        }
        assert_eq!(seen, 30);
    }
}
