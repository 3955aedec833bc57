pub mod api;
mod error;
pub mod priority;
pub mod routing;
pub mod status;
pub mod task;
pub mod validation;
pub mod worker;

pub use error::{HubError, Result};
pub use priority::{default_priorities, PriorityWeights, FALLBACK_PRIORITY};
pub use routing::RoutingKey;
pub use status::TaskStatus;
pub use task::{new_task_id, Attempt, AttemptReport, Task, TaskFilter};
pub use validation::MAX_PAYLOAD_SIZE;
pub use worker::{QueueGroup, WorkerConfig};
