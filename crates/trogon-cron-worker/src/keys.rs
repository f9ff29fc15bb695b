//! Key layout of the coordination bucket.
//!
//! | Key | Value |
//! |-----|-------|
//! | `job.<job_id>` | [`Job`](crate::model::Job) |
//! | `once.<host_name>.<task_id>` | [`OnceJob`](crate::model::OnceJob) |
//! | `proc.<node_id>.<job_id>.<pid>` | [`ProcessVal`](crate::model::ProcessVal) |
//!
//! Host names and node ids may contain dots, so multi-token segments are
//! always parsed from the right.

pub const DEFAULT_BUCKET: &str = "cron_jobs";
pub const JOB_KEY_PREFIX: &str = "job.";
pub const ONCE_KEY_PREFIX: &str = "once.";
pub const PROC_KEY_PREFIX: &str = "proc.";

pub fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

pub fn job_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(JOB_KEY_PREFIX).filter(|id| !id.is_empty())
}

/// Prefix of the one-shot requests addressed to `host_name`.
pub fn once_prefix(host_name: &str) -> String {
    format!("{ONCE_KEY_PREFIX}{host_name}.")
}

pub fn once_key(host_name: &str, task_id: &str) -> String {
    format!("{}{task_id}", once_prefix(host_name))
}

pub fn proc_key(node_id: &str, job_id: &str, pid: u32) -> String {
    format!("{PROC_KEY_PREFIX}{node_id}.{job_id}.{pid}")
}

/// Watch pattern matching every key below `prefix`.
pub fn watch_pattern(prefix: &str) -> String {
    format!("{prefix}>")
}

/// Returns the first character that cannot appear in a single KV key token.
pub fn invalid_token_char(token: &str) -> Option<char> {
    token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '/')))
}

/// Like [`invalid_token_char`] but dots are allowed between non-empty tokens.
pub fn invalid_dotted_char(value: &str) -> Option<char> {
    if value.starts_with('.') || value.ends_with('.') || value.contains("..") {
        return Some('.');
    }
    value.split('.').find_map(invalid_token_char)
}
