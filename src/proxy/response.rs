//! Gateway-generated responses: 401, 404, 502 and 504.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use pingora_core::prelude::*;
use pingora_http::ResponseHeader;

pub const ACCESS_CONTROL_ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
pub const CORS_ALLOW_ANY: &str = "*";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// True if any `Accept` header mentions `application/json`.
pub fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("application/json"))
}

/// Adds the CORS header every response carries.
pub fn insert_cors(header: &mut ResponseHeader) -> Result<()> {
    header.insert_header(ACCESS_CONTROL_ALLOW_ORIGIN, CORS_ALLOW_ANY)
}

/// Prepares a backend response for the caller.
///
/// Custom headers replace any backend value with the same name. A name
/// listed more than once is sent once per entry. CORS is added last.
pub fn relay_headers(
    custom: &[(HeaderName, HeaderValue)],
    header: &mut ResponseHeader,
) -> Result<()> {
    for (name, _) in custom {
        header.remove_header(name);
    }
    for (name, value) in custom {
        header.append_header(name.clone(), value.clone())?;
    }
    insert_cors(header)
}

/// A short error body negotiated on `Accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl ErrorResponse {
    /// Body for a gateway-generated status; unknown codes read as a bad
    /// gateway.
    pub fn for_status(status: u16, json: bool) -> Self {
        let message = match status {
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            504 => "Gateway Timeout",
            _ => "Bad Gateway",
        };

        if json {
            let body = serde_json::json!({ "_error": message }).to_string();
            Self {
                status,
                content_type: JSON_CONTENT_TYPE,
                body: Bytes::from(body),
            }
        } else {
            Self {
                status,
                content_type: TEXT_CONTENT_TYPE,
                body: Bytes::from_static(message.as_bytes()),
            }
        }
    }

    /// Status line plus content type, length and CORS.
    pub fn to_header(&self) -> Result<ResponseHeader> {
        let mut header = ResponseHeader::build(self.status, Some(3))?;
        header.insert_header(CONTENT_TYPE, self.content_type)?;
        header.insert_header(CONTENT_LENGTH, self.body.len().to_string())?;
        insert_cors(&mut header)?;
        Ok(header)
    }
}
