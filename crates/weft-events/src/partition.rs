/// Stable partition for a topic.
///
/// A 31-multiplier string hash in wrapping 32-bit arithmetic. The value only
/// depends on the topic bytes, so a topic keeps its partition for as long as
/// the partition count stays the same, across restarts and builds.
pub fn partition_for(topic: &str, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    let mut hash: i32 = 0;
    for unit in topic.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    (hash.unsigned_abs() as usize) % partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_topic_same_partition() {
        for _ in 0..10 {
            assert_eq!(partition_for("orders", 8), partition_for("orders", 8));
        }
    }

    #[test]
    fn test_within_range() {
        for topic in ["a", "orders", "data.processed", "", "ünïcode"] {
            assert!(partition_for(topic, 3) < 3);
        }
    }

    #[test]
    fn test_known_values() {
        // "ab" = 97 * 31 + 98 = 3105
        assert_eq!(partition_for("ab", 4), 3105 % 4);
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_spreads_topics() {
        let used: std::collections::HashSet<usize> = (0..64)
            .map(|i| partition_for(&format!("topic-{}", i), 4))
            .collect();
        assert_eq!(used.len(), 4);
    }
}
