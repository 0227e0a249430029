use std::time::Duration;

use serde::Deserialize;

use pid_migration_core::{FieldIndex, MigrationError, RawField};

const DEFAULT_BASE_URL: &str = "https://hdl.handle.net";

/// One resolved value as the Handle REST API reports it. The API renders
/// timestamps as RFC 3339 strings, not epoch seconds, so resolved fields
/// never carry a usable stored timestamp.
#[derive(Debug, Deserialize)]
struct ApiValue {
    index: i64,
    #[serde(rename = "type")]
    field_type: String,
    data: ApiData,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(rename = "responseCode")]
    response_code: i64,
    #[serde(default)]
    values: Vec<ApiValue>,
}

/// Resolves predecessor records through a Handle server's REST API.
///
/// Satisfies the resolver capability the transformation engine takes as a
/// closure; the driver wraps [`Self::resolve`] in one.
#[derive(Debug)]
pub struct RemoteResolver {
    agent: ureq::Agent,
    base_url: String,
}

impl RemoteResolver {
    #[must_use]
    pub fn new(base_url: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// Resolve one handle to its field index, or `None` when it does not
    /// exist. A syntactically invalid handle also resolves to `None`, with
    /// a warning, rather than being sent to the server.
    ///
    /// # Errors
    /// Returns [`MigrationError::Connectivity`] on transport failures and
    /// unexpected HTTP statuses.
    pub fn resolve(&self, handle: &str) -> Result<Option<FieldIndex>, MigrationError> {
        if !has_handle_syntax(handle) {
            tracing::warn!(%handle, "pointer value is not a syntactically valid handle");
            return Ok(None);
        }

        let url = format!("{}/api/handles/{handle}", self.base_url);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                return Err(MigrationError::Connectivity(format!(
                    "resolving {handle}: unexpected HTTP status {code}"
                )));
            }
            Err(err) => {
                return Err(MigrationError::Connectivity(format!("resolving {handle}: {err}")));
            }
        };

        let body: ApiResponse = response.into_json().map_err(|err| {
            MigrationError::Connectivity(format!("decoding response for {handle}: {err}"))
        })?;
        record_from_response(body)
    }
}

/// A handle is `prefix/suffix` with both parts non-empty.
fn has_handle_syntax(handle: &str) -> bool {
    matches!(handle.split_once('/'), Some((prefix, suffix)) if !prefix.is_empty() && !suffix.is_empty())
}

fn record_from_response(body: ApiResponse) -> Result<Option<FieldIndex>, MigrationError> {
    if body.response_code != 1 {
        return Ok(None);
    }
    let rows = body
        .values
        .into_iter()
        .map(|value| RawField {
            index: value.index,
            field_type: value.field_type,
            value: match value.data.value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            },
            timestamp: None,
        })
        .collect();
    FieldIndex::build(rows).map(Some)
}
