//! Decoding and validation of raw KV entries.

use std::collections::HashSet;

use crate::error::DecodeError;
use crate::keys::{self, PROC_KEY_PREFIX};
use crate::model::{Job, OnceJob, ProcessKey, ProcessVal};
use crate::scheduler::parse_schedule;

/// Decode a `job.<id>` entry. Every timer's cron expression is checked here
/// so registering the job's commands cannot fail later.
pub fn decode_job(key: &str, value: &[u8]) -> Result<Job, DecodeError> {
    let job: Job = parse_json(key, value)?;
    validate_job_fields(key, &job)?;

    if let Some(id) = keys::job_id_from_key(key) {
        if id != job.id {
            return Err(DecodeError::invalid(
                key,
                format!("id '{}' does not match key", job.id),
            ));
        }
    }

    let mut seen = HashSet::new();
    for timer in &job.timers {
        if timer.id.is_empty() {
            return Err(DecodeError::invalid(key, "timer_id must not be empty"));
        }
        if !seen.insert(timer.id.as_str()) {
            return Err(DecodeError::invalid(
                key,
                format!("duplicate timer_id '{}'", timer.id),
            ));
        }
        parse_schedule(&timer.cron).map_err(|e| DecodeError::invalid(key, e.to_string()))?;
    }

    Ok(job)
}

/// Decode a `once.<host>.<task_id>` entry. A missing `task_id` is taken
/// from the last key token.
pub fn decode_once_job(key: &str, value: &[u8]) -> Result<OnceJob, DecodeError> {
    let mut once: OnceJob = parse_json(key, value)?;
    validate_job_fields(key, &once.job)?;

    if once.task_id.is_empty() {
        once.task_id = key.rsplit('.').next().unwrap_or_default().to_string();
    }
    if once.task_id.is_empty() {
        return Err(DecodeError::invalid(key, "task_id must not be empty"));
    }

    Ok(once)
}

/// Parse `proc.<node_id>.<job_id>.<pid>`. The node id may itself contain dots.
pub fn parse_proc_key(key: &str) -> Result<ProcessKey, DecodeError> {
    let rest = key
        .strip_prefix(PROC_KEY_PREFIX)
        .ok_or_else(|| DecodeError::key(key, "missing proc prefix"))?;

    let mut parts = rest.rsplitn(3, '.');
    let pid = parts.next().unwrap_or_default();
    let job_id = parts.next().unwrap_or_default();
    let node_id = parts.next().unwrap_or_default();

    if node_id.is_empty() || job_id.is_empty() || pid.is_empty() {
        return Err(DecodeError::key(key, "expected proc.<node>.<job>.<pid>"));
    }

    let pid: i32 = pid
        .parse()
        .map_err(|_| DecodeError::key(key, format!("pid '{pid}' is not a number")))?;
    if pid <= 0 {
        return Err(DecodeError::key(key, format!("pid {pid} is not positive")));
    }

    Ok(ProcessKey {
        node_id: node_id.to_string(),
        job_id: job_id.to_string(),
        pid,
    })
}

pub fn decode_process_val(key: &str, value: &[u8]) -> Result<ProcessVal, DecodeError> {
    parse_json(key, value)
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, value: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(value).map_err(|source| DecodeError::Json {
        key: key.to_string(),
        source,
    })
}

fn validate_job_fields(key: &str, job: &Job) -> Result<(), DecodeError> {
    if job.id.is_empty() {
        return Err(DecodeError::invalid(key, "id must not be empty"));
    }
    if let Some(ch) = keys::invalid_token_char(&job.id) {
        return Err(DecodeError::invalid(
            key,
            format!("id contains invalid character {ch:?}"),
        ));
    }
    if job.command.trim().is_empty() {
        return Err(DecodeError::invalid(key, "command must not be empty"));
    }
    if job.timeout_sec == Some(0) {
        return Err(DecodeError::invalid(key, "timeout_sec must be >= 1 when set"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_json(id: &str, cron: &str) -> Vec<u8> {
        serde_json::json!({
            "id": id,
            "command": "echo hi",
            "timers": [{ "timer_id": "t1", "cron": cron, "nodes": ["node-1"] }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn decodes_valid_job() {
        let job = decode_job("job.backup", &job_json("backup", "* * * * *")).unwrap();
        assert_eq!(job.id, "backup");
        assert_eq!(job.timers.len(), 1);
        assert!(job.run_on.is_none());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = decode_job("job.backup", b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Json { .. }));
    }

    #[test]
    fn rejects_bad_cron_expression() {
        let err = decode_job("job.backup", &job_json("backup", "every minute")).unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn rejects_id_key_mismatch() {
        let err = decode_job("job.other", &job_json("backup", "* * * * *")).unwrap_err();
        assert!(err.to_string().contains("does not match key"));
    }

    #[test]
    fn rejects_dotted_id() {
        let err = decode_job("job.a.b", &job_json("a.b", "* * * * *")).unwrap_err();
        assert!(err.to_string().contains("invalid character"));
    }

    #[test]
    fn rejects_empty_command() {
        let value = br#"{"id":"backup","command":"  ","timers":[]}"#;
        let err = decode_job("job.backup", value).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn rejects_duplicate_timer_ids() {
        let value = serde_json::json!({
            "id": "backup",
            "command": "echo hi",
            "timers": [
                { "timer_id": "t1", "cron": "* * * * *", "nodes": [] },
                { "timer_id": "t1", "cron": "*/5 * * * *", "nodes": [] }
            ]
        })
        .to_string();
        let err = decode_job("job.backup", value.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("duplicate timer_id"));
    }

    #[test]
    fn once_job_task_id_falls_back_to_key() {
        let once = decode_once_job(
            "once.node-1.9001",
            br#"{"id":"backup","command":"echo hi"}"#,
        )
        .unwrap();
        assert_eq!(once.task_id, "9001");
    }

    #[test]
    fn once_job_keeps_explicit_task_id() {
        let once = decode_once_job(
            "once.node-1.9001",
            br#"{"id":"backup","command":"echo hi","task_id":"abc"}"#,
        )
        .unwrap();
        assert_eq!(once.task_id, "abc");
    }

    #[test]
    fn once_job_requires_command() {
        assert!(decode_once_job("once.node-1.1", br#"{"id":"backup"}"#).is_err());
    }

    #[test]
    fn parses_proc_key_with_dotted_node() {
        let key = parse_proc_key("proc.web-1.dc1.backup.4242").unwrap();
        assert_eq!(key.node_id, "web-1.dc1");
        assert_eq!(key.job_id, "backup");
        assert_eq!(key.pid, 4242);
    }

    #[test]
    fn rejects_short_or_non_numeric_proc_keys() {
        assert!(parse_proc_key("proc.backup.4242").is_err());
        assert!(parse_proc_key("proc.node.backup.abc").is_err());
        assert!(parse_proc_key("proc.node.backup.0").is_err());
        assert!(parse_proc_key("job.node.backup.1").is_err());
    }

    #[test]
    fn decodes_process_val() {
        let val = decode_process_val("proc.n.j.1", br#"{"killed":true}"#).unwrap();
        assert!(val.killed);
        assert!(val.time.is_none());
    }
}
