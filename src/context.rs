//! Request context and framework adapter traits
//!
//! Framework adapters wrap the host server's request and response objects
//! behind [`HttpRequest`] and [`HttpResponse`]. The detection core only ever
//! sees these traits.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Read access to the request being serviced
///
/// Every accessor returns `None` when the underlying framework cannot
/// provide the value; alert assembly treats that as an absent field.
pub trait HttpRequest: Send {
    fn method(&self) -> Option<String>;

    /// Full request URL including scheme and host, without the query string
    fn request_url(&self) -> Option<String>;

    fn query_string(&self) -> Option<String>;

    /// Path component of the URL
    fn request_uri(&self) -> Option<String>;

    /// Client address
    fn remote_addr(&self) -> Option<String>;

    /// Address the server accepted the connection on
    fn local_addr(&self) -> Option<String>;

    /// Server name from the Host header or virtual host config
    fn server_name(&self) -> Option<String>;

    /// Case-insensitive header lookup
    fn header(&self, name: &str) -> Option<String>;

    /// All request headers, lower-cased names
    fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Decoded request parameters
    ///
    /// Only read once the host has signalled that parameters are safe to
    /// access; reading them earlier can consume the request body.
    fn parameters(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }
}

/// Write access to the response of the request being serviced
pub trait HttpResponse: Send {
    fn set_header(&mut self, name: &str, value: &str);

    fn set_status(&mut self, status: u16);

    /// Whether status and headers have already been sent
    fn is_committed(&self) -> bool;

    /// Discard buffered, unsent body bytes
    fn reset_buffer(&mut self);

    /// Write `body` and flush
    fn send_content(&mut self, body: &str);

    /// `Content-Type` of the response, when the framework exposes it
    fn content_type(&self) -> Option<String> {
        None
    }
}

/// Per-request state owned by the servicing thread
pub struct RequestContext {
    id: String,
    request: Box<dyn HttpRequest>,
    response: Option<Box<dyn HttpResponse>>,
    body: Vec<u8>,
    body_max_bytes: usize,
    can_get_parameter: bool,
    created_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(
        request: Box<dyn HttpRequest>,
        response: Option<Box<dyn HttpResponse>>,
        body_max_bytes: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            request,
            response,
            body: Vec::new(),
            body_max_bytes,
            can_get_parameter: false,
            created_at: Utc::now(),
        }
    }

    /// Unique request id (32 lowercase hex characters)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &dyn HttpRequest {
        self.request.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut (dyn HttpResponse + 'static)> {
        self.response.as_deref_mut()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Captured request body, at most `body.maxbytes` bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append body bytes read by the host
    ///
    /// Bytes past the cap are dropped. Never fails.
    pub fn append_body(&mut self, bytes: &[u8]) {
        let room = self.body_max_bytes.saturating_sub(self.body.len());
        let take = room.min(bytes.len());
        self.body.extend_from_slice(&bytes[..take]);
    }

    pub fn can_get_parameter(&self) -> bool {
        self.can_get_parameter
    }

    pub fn set_can_get_parameter(&mut self, allowed: bool) {
        self.can_get_parameter = allowed;
    }

    /// Request parameters, empty until parameter access is enabled
    pub fn parameters(&self) -> BTreeMap<String, Vec<String>> {
        if self.can_get_parameter {
            self.request.parameters()
        } else {
            BTreeMap::new()
        }
    }

    /// Path and query as the client sent them
    pub fn path_with_query(&self) -> Option<String> {
        let path = self.request.request_uri()?;
        Some(match self.request.query_string() {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path,
        })
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("body_max_bytes", &self.body_max_bytes)
            .field("can_get_parameter", &self.can_get_parameter)
            .field("has_response", &self.response.is_some())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_request_id_is_simple_uuid() {
        let ctx = RequestContext::new(Box::new(FakeRequest::get("/")), None, 16);
        assert_eq!(ctx.id().len(), 32);
        assert!(ctx.id().chars().all(|c| c.is_ascii_hexdigit()));

        let other = RequestContext::new(Box::new(FakeRequest::get("/")), None, 16);
        assert_ne!(ctx.id(), other.id());
    }

    #[test]
    fn test_body_capture_stops_at_cap() {
        let mut ctx = RequestContext::new(Box::new(FakeRequest::get("/")), None, 10);
        ctx.append_body(b"abcdefgh");
        ctx.append_body(b"ijklmno");
        assert_eq!(ctx.body(), b"abcdefghij");
        ctx.append_body(b"zzz");
        assert_eq!(ctx.body().len(), 10);
    }

    #[test]
    fn test_zero_cap_captures_nothing() {
        let mut ctx = RequestContext::new(Box::new(FakeRequest::get("/")), None, 0);
        ctx.append_body(b"abc");
        assert!(ctx.body().is_empty());
    }

    #[test]
    fn test_parameters_hidden_until_enabled() {
        let mut req = FakeRequest::get("/search");
        req.params
            .insert("q".to_string(), vec!["1' or '1'='1".to_string()]);
        let mut ctx = RequestContext::new(Box::new(req), None, 16);
        assert!(ctx.parameters().is_empty());
        ctx.set_can_get_parameter(true);
        assert_eq!(ctx.parameters()["q"][0], "1' or '1'='1");
    }

    #[test]
    fn test_path_with_query() {
        let mut req = FakeRequest::get("/a");
        req.query = Some("x=1".to_string());
        let ctx = RequestContext::new(Box::new(req), None, 0);
        assert_eq!(ctx.path_with_query().as_deref(), Some("/a?x=1"));
    }
}
