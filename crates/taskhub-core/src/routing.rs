use crate::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const SEPARATOR: char = ':';

/// Broker address of one priority channel: `worker:group:priority`.
///
/// Both the enqueue side and the worker side build it from the same three
/// components, so the rendered string is the only contract between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingKey {
    pub worker_name: String,
    pub queue_group: String,
    pub priority: String,
}

impl RoutingKey {
    pub fn new(
        worker_name: impl Into<String>,
        queue_group: impl Into<String>,
        priority: impl Into<String>,
    ) -> Self {
        RoutingKey {
            worker_name: worker_name.into(),
            queue_group: queue_group.into(),
            priority: priority.into(),
        }
    }

    /// Parse a rendered key. Components never contain `:` so the split is exact.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(w), Some(g), Some(p), None) if !w.is_empty() && !g.is_empty() && !p.is_empty() => {
                Ok(RoutingKey::new(w, g, p))
            }
            _ => Err(HubError::Validation(format!("malformed routing key {s:?}"))),
        }
    }

    pub fn as_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.worker_name, self.queue_group, self.priority
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_render() {
        let key = RoutingKey::new("w1", "jobs", "critical");
        assert_eq!(key.to_string(), "w1:jobs:critical");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RoutingKey::parse("w1:jobs").is_err());
        assert!(RoutingKey::parse("w1:jobs:low:extra").is_err());
        assert!(RoutingKey::parse("w1::low").is_err());
        assert_eq!(
            RoutingKey::parse("w1:jobs:low").unwrap(),
            RoutingKey::new("w1", "jobs", "low")
        );
    }

    proptest! {
        #[test]
        fn prop_render_is_deterministic(
            w in "[A-Za-z0-9_-]{3,64}",
            g in "[A-Za-z0-9_-]{1,64}",
            p in "[A-Za-z0-9_-]{1,64}",
        ) {
            let enqueue_side = RoutingKey::new(w.clone(), g.clone(), p.clone()).to_string();
            let worker_side = RoutingKey::new(w.as_str(), g.as_str(), p.as_str()).to_string();
            prop_assert_eq!(enqueue_side.as_bytes(), worker_side.as_bytes());
            prop_assert_eq!(RoutingKey::parse(&enqueue_side).unwrap(), RoutingKey::new(w, g, p));
        }
    }
}
