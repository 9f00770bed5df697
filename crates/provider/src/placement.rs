//! Where the upstream key goes in an outbound request
//!
//! Two deployment modes exist. `Query` appends `key=<secret>` to the URL,
//! replacing any `key` the client sent. `BodyPlaceholder` walks the JSON body
//! and replaces string values that are exactly the placeholder token, so the
//! client never handles the real key and partial matches inside other text are
//! left alone.

use bytes::Bytes;
use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::{ProviderError, Result, UpstreamRequest};

/// Default placeholder clients put in the body in `body` mode.
pub const DEFAULT_PLACEHOLDER: &str = "{{GEMINI_API_KEY}}";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CredentialPlacement {
    Query { param: String },
    BodyPlaceholder { token: String },
}

impl Default for CredentialPlacement {
    fn default() -> Self {
        Self::Query {
            param: "key".to_string(),
        }
    }
}

impl CredentialPlacement {
    /// Attach `secret` to the request according to this placement.
    ///
    /// Returns `false` when the request left without the key: in body mode
    /// that means no placeholder was found.
    pub fn apply(&self, request: &mut UpstreamRequest, secret: &Secret<String>) -> Result<bool> {
        match self {
            Self::Query { param } => {
                set_query_param(&mut request.url, param, secret.expose());
                Ok(true)
            }
            Self::BodyPlaceholder { token } => {
                match substitute_body(&request.body, token, secret.expose())? {
                    Some(body) => {
                        request.body = body;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }
}

/// Set `param` to `value`, dropping any occurrences the client supplied.
fn set_query_param(url: &mut reqwest::Url, param: &str, value: &str) {
    let has_param = url.query_pairs().any(|(k, _)| k == param);
    if has_param {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != param)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.set_query(None);
        let mut pairs = url.query_pairs_mut();
        pairs.extend_pairs(kept);
        pairs.append_pair(param, value);
    } else {
        url.query_pairs_mut().append_pair(param, value);
    }
}

/// Returns the rewritten body, or `None` when nothing was replaced
/// (empty body, non-JSON body, or no placeholder present).
fn substitute_body(body: &Bytes, token: &str, secret: &str) -> Result<Option<Bytes>> {
    if body.is_empty() {
        return Ok(None);
    }
    let mut json: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            debug!("request body is not JSON, forwarding without substitution");
            return Ok(None);
        }
    };

    let replaced = replace_placeholder(&mut json, token, secret);
    if replaced == 0 {
        debug!("no credential placeholder found in request body");
        return Ok(None);
    }
    debug!(replaced, "credential placeholder substituted");

    let bytes = serde_json::to_vec(&json)
        .map_err(|e| ProviderError::Internal(format!("re-serializing body failed: {e}")))?;
    Ok(Some(Bytes::from(bytes)))
}

fn replace_placeholder(value: &mut serde_json::Value, token: &str, secret: &str) -> usize {
    match value {
        serde_json::Value::String(s) if s == token => {
            *s = secret.to_string();
            1
        }
        serde_json::Value::Array(items) => items
            .iter_mut()
            .map(|v| replace_placeholder(v, token, secret))
            .sum(),
        serde_json::Value::Object(map) => map
            .values_mut()
            .map(|v| replace_placeholder(v, token, secret))
            .sum(),
        _ => 0,
    }
}
