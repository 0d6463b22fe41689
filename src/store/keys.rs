//! Key layout for persisted service state.
//!
//! ```text
//! {prefix}/{namespace}/executors/{id}/heartbeat        -> unix seconds
//! {prefix}/{namespace}/executors/{id}/status           -> quoted status tag
//! {prefix}/{namespace}/executors/{id}/reported_shards  -> JSON
//! {prefix}/{namespace}/executors/{id}/assigned_state   -> JSON
//! {prefix}/{namespace}/executors/{id}/metadata/{key}   -> string
//! {prefix}/{namespace}/leader/{lease}                  -> leader host tag
//! ```

/// Executor heartbeat timestamp fragment.
pub const HEARTBEAT_KEY: &str = "heartbeat";
/// Executor status fragment.
pub const STATUS_KEY: &str = "status";
/// Executor-reported shards fragment.
pub const REPORTED_SHARDS_KEY: &str = "reported_shards";
/// Leader-authored assignment fragment.
pub const ASSIGNED_STATE_KEY: &str = "assigned_state";
/// Executor metadata fragment.
pub const METADATA_KEY: &str = "metadata";

/// Prefix for all keys of one namespace.
pub fn namespace_prefix(prefix: &str, namespace: &str) -> String {
    format!("{prefix}/{namespace}")
}

/// Prefix for all executor keys of one namespace. Ends with `/`.
pub fn executor_prefix(prefix: &str, namespace: &str) -> String {
    format!("{}/executors/", namespace_prefix(prefix, namespace))
}

/// Prefix for all keys of one executor. Ends with `/`.
pub fn executor_scope(prefix: &str, namespace: &str, executor_id: &str) -> String {
    format!("{}{executor_id}/", executor_prefix(prefix, namespace))
}

/// One executor key (`heartbeat`, `status`, `reported_shards`,
/// `assigned_state`).
pub fn executor_key(prefix: &str, namespace: &str, executor_id: &str, fragment: &str) -> String {
    format!("{}{fragment}", executor_scope(prefix, namespace, executor_id))
}

/// One executor metadata key.
pub fn metadata_key(prefix: &str, namespace: &str, executor_id: &str, meta_key: &str) -> String {
    format!(
        "{}{METADATA_KEY}/{meta_key}",
        executor_scope(prefix, namespace, executor_id)
    )
}

/// Prefix under which leader-election candidate keys live.
pub fn leader_prefix(prefix: &str, namespace: &str) -> String {
    format!("{}/leader", namespace_prefix(prefix, namespace))
}

/// A parsed executor key fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorKeyPart {
    Heartbeat,
    Status,
    ReportedShards,
    AssignedState,
    Metadata(String),
}

/// Parse a full key into `(executor_id, part)`.
///
/// Returns `None` for keys outside the executor prefix and for unknown
/// fragments; readers ignore those for forward compatibility.
pub fn parse_executor_key(
    prefix: &str,
    namespace: &str,
    key: &str,
) -> Option<(String, ExecutorKeyPart)> {
    let executor_prefix = executor_prefix(prefix, namespace);
    let remainder = key.strip_prefix(executor_prefix.as_str())?;
    let parts: Vec<&str> = remainder.split('/').collect();
    match parts.as_slice() {
        [executor_id, fragment] => {
            let part = match *fragment {
                HEARTBEAT_KEY => ExecutorKeyPart::Heartbeat,
                STATUS_KEY => ExecutorKeyPart::Status,
                REPORTED_SHARDS_KEY => ExecutorKeyPart::ReportedShards,
                ASSIGNED_STATE_KEY => ExecutorKeyPart::AssignedState,
                _ => return None,
            };
            Some((executor_id.to_string(), part))
        }
        [executor_id, METADATA_KEY, meta_key] => Some((
            executor_id.to_string(),
            ExecutorKeyPart::Metadata(meta_key.to_string()),
        )),
        _ => None,
    }
}
