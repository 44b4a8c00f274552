//! Wire constants and request bodies shared by server and client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the authentication token.
pub const HEADER_AUTH: &str = "x-snapferry-auth";
/// Query parameter carrying the authentication token when no header is set.
pub const QUERY_AUTH: &str = "authToken";
/// Header carrying a receive resume token.
pub const HEADER_RESUME_TOKEN: &str = "x-receive-resume-token";
/// Query parameter marking a receive resumable.
pub const QUERY_RESUMABLE: &str = "resumable";
/// Query parameter with JSON encoded properties to set on receive.
pub const QUERY_RECEIVE_PROPERTIES: &str = "receiveProperties";
/// Query parameter with comma separated extra properties to return.
pub const QUERY_EXTRA_PROPERTIES: &str = "extraProperties";

/// Body of a property PATCH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyPatch {
    /// Properties to set locally.
    pub set: HashMap<String, String>,
    /// Properties to reset to the inherited value.
    pub unset: Vec<String>,
}

/// Query string of list and read requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraPropsQuery {
    /// Comma separated property names.
    #[serde(rename = "extraProperties", default)]
    pub extra_properties: Option<String>,
}

impl ExtraPropsQuery {
    /// Requested property names.
    pub fn names(&self) -> Vec<String> {
        split_props(self.extra_properties.as_deref())
    }
}

/// Query string of receive requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiveQuery {
    /// Keep partial state if the stream is cut.
    #[serde(default)]
    pub resumable: Option<String>,
    /// JSON object of properties to set on the received dataset.
    #[serde(rename = "receiveProperties", default)]
    pub receive_properties: Option<String>,
}

impl ReceiveQuery {
    /// Whether the `resumable` flag is set.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.resumable.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("true") | Some("1") | Some("")
        )
    }

    /// Decoded receive properties.
    pub fn properties(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        match self.receive_properties.as_deref() {
            None | Some("") => Ok(HashMap::new()),
            Some(raw) => serde_json::from_str(raw),
        }
    }
}

fn split_props(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Percent-encodes a logical dataset name for use as one path segment.
pub fn encode_segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}
