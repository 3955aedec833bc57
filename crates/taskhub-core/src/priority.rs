use std::collections::BTreeMap;

/// Name -> weight map of one queue group's priority channels.
/// Higher weights are dequeued proportionally more often by the broker.
pub type PriorityWeights = BTreeMap<String, i32>;

pub const PRIORITY_CRITICAL: &str = "critical";
pub const PRIORITY_DEFAULT: &str = "default";
pub const PRIORITY_LOW: &str = "low";

/// Priority used when an enqueue request names none.
pub const FALLBACK_PRIORITY: &str = PRIORITY_DEFAULT;

/// Weights applied to a queue group declared without priorities.
pub fn default_priorities() -> PriorityWeights {
    let mut weights = PriorityWeights::new();
    weights.insert(PRIORITY_CRITICAL.to_string(), 50);
    weights.insert(PRIORITY_DEFAULT.to_string(), 30);
    weights.insert(PRIORITY_LOW.to_string(), 10);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let weights = default_priorities();
        assert_eq!(weights.len(), 3);
        assert_eq!(weights[PRIORITY_CRITICAL], 50);
        assert_eq!(weights[PRIORITY_DEFAULT], 30);
        assert_eq!(weights[PRIORITY_LOW], 10);
    }

    #[test]
    fn test_weight_ordering() {
        let weights = default_priorities();
        assert!(weights[PRIORITY_CRITICAL] > weights[PRIORITY_DEFAULT]);
        assert!(weights[PRIORITY_DEFAULT] > weights[PRIORITY_LOW]);
    }
}
