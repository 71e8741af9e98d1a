//! Block page emission

use crate::config::{ConfigStore, Settings};
use crate::context::{HttpResponse, RequestContext};
use crate::error::{RaspError, Result};
use crate::monitor::FileListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Directory under the agent base dir holding the block page fragment
pub const ASSETS_DIR_NAME: &str = "assets";

/// Block page fragment file name
pub const BLOCK_PAGE_FILE_NAME: &str = "inject.html";

/// Optional HTML fragment appended to every block response
///
/// Hot-reloaded: deleting the file removes the fragment.
pub struct CustomBlockPage {
    path: PathBuf,
    content: RwLock<Option<Arc<str>>>,
}

impl CustomBlockPage {
    /// Page backed by `path`; nothing is read until [`reload`](Self::reload)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content: RwLock::new(None),
        }
    }

    /// Page with no backing file
    pub fn none() -> Self {
        Self::new(PathBuf::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> Option<Arc<str>> {
        self.content
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the fragment file; a missing file clears the fragment
    pub fn reload(&self) -> Result<()> {
        let next = match std::fs::read_to_string(&self.path) {
            Ok(text) => Some(Arc::from(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(RaspError::io(&self.path, e)),
        };
        tracing::debug!(path = %self.path.display(), present = next.is_some(), "Block page reloaded");
        *self.content.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    fn reload_if_matches(&self, changed: &Path) {
        if changed.file_name() != self.path.file_name() {
            return;
        }
        if let Err(e) = self.reload() {
            tracing::warn!(path = %self.path.display(), error = %e, "Block page reload failed");
        }
    }
}

impl FileListener for CustomBlockPage {
    fn on_file_create(&self, path: &Path) {
        self.reload_if_matches(path);
    }

    fn on_file_change(&self, path: &Path) {
        self.reload_if_matches(path);
    }

    fn on_file_delete(&self, path: &Path) {
        self.reload_if_matches(path);
    }
}

/// Block URL with the request id attached, unless it already carries one
pub fn block_url(base: &str, request_id: &str) -> String {
    if base.contains("request_id=") {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}request_id={}", base, separator, request_id)
}

/// Body of a block response
///
/// The leading `</script>` escapes an inline script block the response
/// may already be inside of.
pub fn block_body(url: &str, fragment: Option<&str>) -> String {
    let mut body = format!(
        "</script><script>location.href=\"{}\"</script>",
        escape_js_string(url)
    );
    if let Some(fragment) = fragment {
        body.push_str(fragment);
    }
    body
}

/// Escape `value` for a double-quoted JavaScript string inside an HTML
/// `<script>` element
fn escape_js_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            '<' if chars.peek() == Some(&'/') => escaped.push_str("<\\"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Writes the block page into a request's response
pub struct BlockResponder {
    config: Arc<ConfigStore>,
    page: Arc<CustomBlockPage>,
}

impl BlockResponder {
    pub fn new(config: Arc<ConfigStore>, page: Arc<CustomBlockPage>) -> Self {
        Self { config, page }
    }

    pub fn page(&self) -> &Arc<CustomBlockPage> {
        &self.page
    }

    /// Best effort: a request without a response adapter is left alone
    pub fn send_block(&self, ctx: &mut RequestContext) {
        let settings = self.config.snapshot();
        let url = block_url(&settings.block_url, ctx.id());
        let fragment = self.page.content();
        let body = block_body(&url, fragment.as_deref());

        match ctx.response_mut() {
            Some(response) => write_block(response, &settings, &url, &body),
            None => tracing::debug!("No response adapter, block page not sent"),
        }
    }
}

fn write_block(response: &mut dyn HttpResponse, settings: &Settings, url: &str, body: &str) {
    let status = settings.block_status_code;
    // Status and headers can only change before the response is committed
    if !response.is_committed() {
        response.set_status(status);
        if (300..=399).contains(&status) {
            response.set_header("Location", url);
        }
        response.set_header("Content-Length", &body.len().to_string());
    }
    response.reset_buffer();
    response.send_content(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{FakeRequest, FakeResponse};

    fn context(response: &FakeResponse) -> RequestContext {
        RequestContext::new(
            Box::new(FakeRequest::get("/")),
            Some(Box::new(response.clone())),
            16,
        )
    }

    #[test]
    fn test_block_url() {
        assert_eq!(
            block_url("https://rasp.baidu.com/blocked", "abc"),
            "https://rasp.baidu.com/blocked?request_id=abc"
        );
        assert_eq!(
            block_url("https://x/blocked?lang=en", "abc"),
            "https://x/blocked?lang=en&request_id=abc"
        );
        assert_eq!(
            block_url("https://x/blocked?request_id=fixed", "abc"),
            "https://x/blocked?request_id=fixed"
        );
    }

    #[test]
    fn test_redirect_block() {
        let response = FakeResponse::default();
        let mut ctx = context(&response);
        let responder = BlockResponder::new(
            Arc::new(ConfigStore::in_memory()),
            Arc::new(CustomBlockPage::none()),
        );
        responder.send_block(&mut ctx);

        let state = response.0.lock().unwrap();
        let expected = format!("https://rasp.baidu.com/blocked?request_id={}", ctx.id());
        assert_eq!(state.status, Some(302));
        assert_eq!(state.headers["Location"], expected);
        assert_eq!(
            state.body,
            format!("</script><script>location.href=\"{}\"</script>", expected)
        );
        assert_eq!(state.headers["Content-Length"], state.body.len().to_string());
    }

    #[test]
    fn test_non_redirect_status_has_no_location() {
        let config = Arc::new(ConfigStore::in_memory());
        config.set("block.status_code", "403");
        let response = FakeResponse::default();
        let mut ctx = context(&response);
        BlockResponder::new(config, Arc::new(CustomBlockPage::none())).send_block(&mut ctx);

        let state = response.0.lock().unwrap();
        assert_eq!(state.status, Some(403));
        assert!(!state.headers.contains_key("Location"));
    }

    #[test]
    fn test_committed_response_only_gets_body() {
        let response = FakeResponse::default();
        response.0.lock().unwrap().committed = true;
        let mut ctx = context(&response);
        BlockResponder::new(
            Arc::new(ConfigStore::in_memory()),
            Arc::new(CustomBlockPage::none()),
        )
        .send_block(&mut ctx);

        let state = response.0.lock().unwrap();
        assert_eq!(state.status, None);
        assert!(state.headers.is_empty());
        assert_eq!(state.resets, 1);
        assert!(state.body.contains("location.href"));
    }

    #[test]
    fn test_custom_fragment_hot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BLOCK_PAGE_FILE_NAME);
        let page = Arc::new(CustomBlockPage::new(&path));
        page.reload().unwrap();
        assert!(page.content().is_none());

        std::fs::write(&path, "<p>blocked</p>").unwrap();
        page.on_file_create(&path);
        assert_eq!(page.content().as_deref(), Some("<p>blocked</p>"));

        page.on_file_change(&dir.path().join("other.html"));
        std::fs::remove_file(&path).unwrap();
        page.on_file_delete(&path);
        assert!(page.content().is_none());
    }

    #[test]
    fn test_fragment_appended_to_body() {
        assert_eq!(
            block_body("u", Some("<b>x</b>")),
            "</script><script>location.href=\"u\"</script><b>x</b>"
        );
    }

    #[test]
    fn test_block_url_is_escaped_in_script() {
        let body = block_body(r#"https://x/b?q="a\b</script><img>"#, None);
        assert_eq!(
            body,
            r#"</script><script>location.href="https://x/b?q=\"a\\b<\/script><img>"</script>"#
        );
        assert_eq!(body.matches("</script>").count(), 2);
        assert_eq!(escape_js_string("a\nb"), "a\\nb");
    }
}
