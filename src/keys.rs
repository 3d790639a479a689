/// Prefix under which all task records live.
pub const TASK_PREFIX: &str = "tasks/";

/// Prefix under which all batch records live.
pub const BATCH_PREFIX: &str = "batches/";

/// The store key for a task record by id.
pub fn task_key(id: &str) -> String {
    format!("tasks/{}", id)
}

/// The store key for an idempotency record by caller-supplied key.
pub fn ledger_key(key: &str) -> String {
    format!("ledger/{}", key)
}

/// The store key for a batch record by id.
pub fn batch_key(id: &str) -> String {
    format!("batches/{}", id)
}
