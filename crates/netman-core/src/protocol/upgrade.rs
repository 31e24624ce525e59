//! HTTP/1.1 upgrade request that opens every WebSocket connection.
//!
//! Parsing and validation are tungstenite's server handshake run against the
//! connection's accumulation buffer; this module adds the size cap and pulls
//! the query string out of the request target.

use bytes::BytesMut;
use tokio_tungstenite::tungstenite::handshake::machine::TryParse;
use tokio_tungstenite::tungstenite::handshake::server::{create_response, write_response, Request};

use super::FrameError;

/// Largest upgrade request accepted before the connection is rejected.
pub const MAX_REQUEST_LEN: usize = 8 * 1024;

/// Response sent to a request that is not a valid WebSocket upgrade.
pub const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Key/value pairs from the upgrade request's query string, in order.
///
/// Keys may repeat; [`QueryParams::get`] returns the first value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Parses an `application/x-www-form-urlencoded` query string (without
    /// the leading `?`).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use netman_core::protocol::QueryParams;
    ///
    /// let query = QueryParams::parse("room=lobby&name=J%C3%B6rg");
    /// assert_eq!(query.get("room"), Some("lobby"));
    /// assert_eq!(query.get("name"), Some("Jörg"));
    /// ```
    pub fn parse(query: &str) -> Self {
        Self(
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validated WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub query: QueryParams,
    /// The serialized `101 Switching Protocols` reply.
    pub response: Vec<u8>,
}

/// Takes a complete upgrade request off the front of `buf`.
///
/// Returns `Ok(None)` until the blank line that ends the headers has
/// arrived.  Bytes after the blank line stay in `buf`; a client may pipeline
/// its first frame behind the request.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if the request grows past
/// [`MAX_REQUEST_LEN`] without ending, or is not a valid WebSocket upgrade.
pub fn parse_upgrade(buf: &mut BytesMut) -> Result<Option<UpgradeRequest>, FrameError> {
    let parsed = Request::try_parse(&buf[..]).map_err(|e| malformed(format!("bad upgrade request: {e}")))?;
    let Some((len, request)) = parsed else {
        if buf.len() > MAX_REQUEST_LEN {
            return Err(too_long());
        }
        return Ok(None);
    };
    if len > MAX_REQUEST_LEN {
        return Err(too_long());
    }

    let response = create_response(&request).map_err(|e| malformed(format!("not a WebSocket upgrade: {e}")))?;
    let mut wire = Vec::with_capacity(160);
    write_response(&mut wire, &response).map_err(|e| malformed(format!("unencodable response: {e}")))?;

    let uri = request.uri();
    let upgrade = UpgradeRequest {
        path: uri.path().to_string(),
        query: uri.query().map(QueryParams::parse).unwrap_or_default(),
        response: wire,
    };
    let _ = buf.split_to(len);
    Ok(Some(upgrade))
}

fn too_long() -> FrameError {
    malformed(format!("upgrade request exceeds {MAX_REQUEST_LEN} bytes"))
}

fn malformed(reason: String) -> FrameError {
    FrameError::Malformed(reason)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
