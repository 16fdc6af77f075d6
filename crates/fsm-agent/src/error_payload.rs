use std::collections::BTreeMap;

use crate::{fetch::FetchError, supervisor::SupervisorError};

pub const PREFIX: &str = "FSM_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const MAX_FIELD_ERROR_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ErrorPayload {
    pub fn new(
        code: &str,
        message: impl Into<String>,
        field_errors: Option<BTreeMap<String, String>>,
        hint: Option<String>,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            field_errors: field_errors.map(|mut m| {
                for v in m.values_mut() {
                    *v = truncate_utf8(v, MAX_FIELD_ERROR_BYTES);
                }
                m
            }),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

pub fn encode(
    code: &str,
    message: impl Into<String>,
    field_errors: Option<BTreeMap<String, String>>,
    hint: Option<String>,
) -> String {
    let payload = ErrorPayload::new(code, message, field_errors, hint);
    let json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());

    format!("{PREFIX}{json}")
}

pub fn anyhow(
    code: &str,
    message: impl Into<String>,
    field_errors: Option<BTreeMap<String, String>>,
    hint: Option<String>,
) -> anyhow::Error {
    anyhow::anyhow!(encode(code, message, field_errors, hint))
}

pub fn decode(s: &str) -> Option<ErrorPayload> {
    serde_json::from_str(s.strip_prefix(PREFIX)?).ok()
}

/// Best structured view of an error chain: typed errors first, then any
/// encoded payload, then the flattened chain as `internal`.
pub fn from_error(err: &anyhow::Error) -> ErrorPayload {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SupervisorError>() {
            return ErrorPayload::new(e.code(), e.to_string(), None, supervisor_hint(e));
        }
        if let Some(e) = cause.downcast_ref::<FetchError>() {
            return ErrorPayload::new(e.code(), e.to_string(), None, None);
        }
        if let Some(p) = decode(&cause.to_string()) {
            return p;
        }
    }
    ErrorPayload::new(
        "internal",
        crate::support::format_error_chain(err),
        None,
        None,
    )
}

fn supervisor_hint(err: &SupervisorError) -> Option<String> {
    match err {
        SupervisorError::BinaryNotFound(_) => {
            Some("install and select a server version first".to_string())
        }
        SupervisorError::NotConfigured { .. } => {
            Some("create the missing settings files in the config directory".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn encode_truncates_message() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let s = encode("test", long, None, None);
        assert!(s.starts_with(PREFIX));

        let payload = decode(&s).unwrap();
        assert!(payload.message.len() <= MAX_MESSAGE_BYTES);
        assert!(payload.message.ends_with("…(truncated)"));
    }

    #[test]
    fn encode_truncates_hint_and_field_errors() {
        let mut fields = BTreeMap::new();
        fields.insert("branch".to_string(), "b".repeat(MAX_FIELD_ERROR_BYTES + 1024));
        let hint = Some("c".repeat(MAX_HINT_BYTES + 1024));
        let payload = decode(&encode("test", "msg", Some(fields), hint)).unwrap();

        let field = payload.field_errors.unwrap().remove("branch").unwrap();
        assert!(field.len() <= MAX_FIELD_ERROR_BYTES);
        assert!(field.ends_with("…(truncated)"));

        let hint = payload.hint.unwrap();
        assert!(hint.len() <= MAX_HINT_BYTES);
        assert!(hint.ends_with("…(truncated)"));
    }

    #[test]
    fn from_error_prefers_typed_errors_through_context() {
        let err = anyhow::Error::new(SupervisorError::BinaryNotFound(PathBuf::from("/x/factorio")))
            .context("start server");
        let payload = from_error(&err);
        assert_eq!(payload.code, "binary_not_found");
        assert!(payload.hint.is_some());
    }

    #[test]
    fn from_error_reads_encoded_payloads() {
        let err = anyhow("mod_not_found", "no such mod", None, None).context("install mod");
        let payload = from_error(&err);
        assert_eq!(payload.code, "mod_not_found");
        assert_eq!(payload.message, "no such mod");

        let plain = anyhow::anyhow!("disk on fire").context("uninstall");
        let payload = from_error(&plain);
        assert_eq!(payload.code, "internal");
        assert_eq!(payload.message, "uninstall: disk on fire");
    }
}
