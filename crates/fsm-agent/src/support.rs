use std::time::Duration;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;
const DEFAULT_CONFIG_DEBOUNCE_MS: u64 = 300;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn log_subscriber_capacity() -> usize {
    env_usize("FSM_LOG_SUBSCRIBER_CAPACITY")
        .map(|v| v.clamp(1, 100_000))
        .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY)
}

pub(crate) fn progress_subscriber_capacity() -> usize {
    env_usize("FSM_PROGRESS_SUBSCRIBER_CAPACITY")
        .map(|v| v.clamp(1, 10_000))
        .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY)
}

pub(crate) fn config_debounce() -> Duration {
    Duration::from_millis(
        env_u64("FSM_CONFIG_DEBOUNCE_MS")
            .map(|v| v.clamp(10, 60_000))
            .unwrap_or(DEFAULT_CONFIG_DEBOUNCE_MS),
    )
}

/// Rejects anything that would not stay a single directory or file name.
pub(crate) fn validate_segment(field: &str, value: &str) -> anyhow::Result<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(field.to_string(), "must be a single path segment".to_string());
        return Err(crate::error_payload::anyhow(
            "invalid_param",
            format!("invalid {field}: {value:?}"),
            Some(fields),
            None,
        ));
    }
    Ok(())
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
