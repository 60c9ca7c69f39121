use std::collections::BTreeMap;
use uuid::Uuid;

/// Header every task carries, assigned at construction
pub const TASK_ID_HEADER: &str = "task_id";

/// Unit of work travelling through the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Task {
    /// Build a task, assigning a fresh `task_id` unless the headers already carry one
    pub fn new(
        task_type: impl Into<String>,
        mut headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        headers
            .entry(TASK_ID_HEADER.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());

        Self {
            task_type: task_type.into(),
            headers,
            body,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.headers.get(TASK_ID_HEADER).map(String::as_str)
    }
}
