//! The Allowed-Queries Checker: a configuration-driven bypass evaluated before token
//! verification. A match short-circuits straight to a grant; a miss falls through to the
//! main checker rather than denying outright.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::patient_finder::RequestContext;

/// A query parameter's expected value in an allow-list entry: either an exact literal or
/// the `ANY_VALUE` wildcard (any single value is accepted, but the parameter must still
/// be present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedValue {
    Exact(String),
    Any,
}

impl<'de> Deserialize<'de> for ExpectedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw == "ANY_VALUE" {
            ExpectedValue::Any
        } else {
            ExpectedValue::Exact(raw)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllowedQueryEntry {
    pub path: String,
    #[serde(default, rename = "queryParams")]
    pub query_params: HashMap<String, ExpectedValue>,
    #[serde(default, rename = "allowExtraParams")]
    pub allow_extra_params: bool,
    #[serde(default = "default_true", rename = "allParamsRequired")]
    pub all_params_required: bool,
    #[serde(default, rename = "allowUnAuthenticatedRequests")]
    pub allow_unauthenticated_requests: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllowedQueriesConfig {
    pub entries: Vec<AllowedQueryEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum AllowedQueriesError {
    #[error("failed to read allow-list file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse allow-list file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl AllowedQueriesConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AllowedQueriesError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| AllowedQueriesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| AllowedQueriesError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Returns the entry matching this request's path and query parameters, if any.
    /// `path` is the resource-relative path (e.g. `"Patient"`, `"Patient/123"`).
    pub fn matches(&self, path: &str, ctx: &RequestContext) -> Option<&AllowedQueryEntry> {
        self.entries.iter().find(|entry| entry.matches(path, ctx))
    }
}

impl AllowedQueryEntry {
    fn matches(&self, path: &str, ctx: &RequestContext) -> bool {
        if self.path != path {
            return false;
        }

        let present: HashMap<&str, &str> = ctx
            .query_params
            .iter()
            .filter_map(|(name, values)| {
                if values.len() == 1 {
                    Some((name.as_str(), values[0].as_str()))
                } else {
                    None
                }
            })
            .collect();

        for (name, expected) in &self.query_params {
            match present.get(name.as_str()) {
                Some(actual) => match expected {
                    ExpectedValue::Any => {}
                    ExpectedValue::Exact(value) if value == actual => {}
                    ExpectedValue::Exact(_) => return false,
                },
                None if self.all_params_required => return false,
                None => {}
            }
        }

        if !self.allow_extra_params {
            let extra = present
                .keys()
                .any(|name| !self.query_params.contains_key(*name));
            if extra {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(params: Vec<(&str, &str)>) -> RequestContext {
        RequestContext {
            verb: crate::patient_finder::Verb::Get,
            resource_type: Some("Patient".to_string()),
            resource_id: None,
            query_params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
        }
    }

    fn entry() -> AllowedQueryEntry {
        AllowedQueryEntry {
            path: "Patient".to_string(),
            query_params: HashMap::from([("name".to_string(), ExpectedValue::Any)]),
            allow_extra_params: false,
            all_params_required: true,
            allow_unauthenticated_requests: false,
        }
    }

    #[test]
    fn any_value_wildcard_matches_any_single_value() {
        assert!(entry().matches("Patient", &ctx(vec![("name", "smith")])));
    }

    #[test]
    fn missing_required_param_does_not_match() {
        assert!(!entry().matches("Patient", &ctx(vec![])));
    }

    #[test]
    fn extra_param_is_rejected_when_not_allowed() {
        assert!(!entry().matches("Patient", &ctx(vec![("name", "smith"), ("_count", "10")])));
    }

    #[test]
    fn extra_param_is_accepted_when_allowed() {
        let mut e = entry();
        e.allow_extra_params = true;
        assert!(e.matches("Patient", &ctx(vec![("name", "smith"), ("_count", "10")])));
    }

    #[test]
    fn exact_value_must_match_literally() {
        let mut e = entry();
        e.query_params = HashMap::from([("name".to_string(), ExpectedValue::Exact("smith".to_string()))]);
        assert!(e.matches("Patient", &ctx(vec![("name", "smith")])));
        assert!(!e.matches("Patient", &ctx(vec![("name", "jones")])));
    }

    #[test]
    fn config_loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed.json");
        std::fs::write(
            &path,
            r#"{"entries":[{"path":"Patient","queryParams":{"name":"ANY_VALUE"},
               "allowExtraParams":false,"allParamsRequired":true,
               "allowUnAuthenticatedRequests":false}]}"#,
        )
        .unwrap();
        let config = AllowedQueriesConfig::load(&path).unwrap();
        assert_eq!(config.entries.len(), 1);
        assert_eq!(config.entries[0].path, "Patient");
    }
}
