/// Data handed to post-job hooks.
///
/// Hooks fire once a job has reached a terminal state and that state has been
/// persisted. They only observe the job; nothing they return feeds back into it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of a finished job, as seen by hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostJobPayload {
    pub job_id: i64,
    /// Stable type name, e.g. `TakeSnapshot`.
    pub job_type: String,
    /// Terminal status name, e.g. `SUCCESS`.
    pub status: String,
    pub target: String,
    pub author: String,
    pub comments: String,
    pub creation_date: DateTime<Utc>,
    pub execution_date: Option<DateTime<Utc>>,
    pub change_date: DateTime<Utc>,
    /// Operator-visible job log.
    pub log: String,
}

/// Body encoding used by [`crate::WebHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebHookFormat {
    PostJson,
    PostYaml,
}

impl WebHookFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::PostJson => "application/json",
            Self::PostYaml => "application/yaml",
        }
    }

    pub fn encode(&self, payload: &PostJobPayload) -> anyhow::Result<String> {
        Ok(match self {
            Self::PostJson => serde_json::to_string(payload)?,
            Self::PostYaml => serde_yaml::to_string(payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PostJobPayload {
        let now = Utc::now();
        PostJobPayload {
            job_id: 42,
            job_type: "TakeSnapshot".into(),
            status: "SUCCESS".into(),
            target: "core-sw-01".into(),
            author: "admin".into(),
            comments: String::new(),
            creation_date: now,
            execution_date: Some(now),
            change_date: now,
            log: "snapshot done".into(),
        }
    }

    #[test]
    fn json_uses_camel_case_keys() {
        let body = WebHookFormat::PostJson.encode(&payload()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["jobId"], 42);
        assert_eq!(v["jobType"], "TakeSnapshot");
    }

    #[test]
    fn yaml_body_contains_status() {
        let body = WebHookFormat::PostYaml.encode(&payload()).unwrap();
        assert!(body.contains("status: SUCCESS"));
    }
}
