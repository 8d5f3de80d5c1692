//! Session-id extraction for sticky routing.
//!
//! Extractors read a session key out of a request or response. The load
//! balancing interceptor consults them before dispatching and again on the
//! response, so a key first issued by a backend binds to the node that
//! issued it.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use http::{HeaderName, header};
use quick_xml::{
    events::Event,
    name::{Namespace, ResolveResult},
    reader::NsReader,
};

use crate::core::{balancer::node::Node, exchange::Message};

/// Pulls a session key out of a message; `Ok(None)` when there is none.
pub trait SessionIdExtractor: Send + Sync + fmt::Debug + 'static {
    fn session_id(&self, message: &dyn Message) -> eyre::Result<Option<String>>;
}

/// A session key bound to a node.
#[derive(Debug, Clone)]
pub struct Session {
    node: Arc<Node>,
    last_used: Instant,
}

impl Session {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            last_used: Instant::now(),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// A zero timeout never expires.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.idle() > timeout
    }
}

/// Text content of the first XML element `{namespace}local_name`. Only
/// messages with an XML content type are inspected.
#[derive(Debug, Clone)]
pub struct XmlElementExtractor {
    namespace: Option<String>,
    local_name: String,
}

impl XmlElementExtractor {
    pub fn new(namespace: Option<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            local_name: local_name.into(),
        }
    }

    fn namespace_matches(&self, resolved: &ResolveResult<'_>) -> bool {
        match (&self.namespace, resolved) {
            (None, _) => true,
            (Some(expected), ResolveResult::Bound(Namespace(ns))) => expected.as_bytes() == *ns,
            (Some(_), _) => false,
        }
    }
}

impl SessionIdExtractor for XmlElementExtractor {
    fn session_id(&self, message: &dyn Message) -> eyre::Result<Option<String>> {
        if !message.is_xml() || message.body().is_empty() {
            return Ok(None);
        }

        let mut reader = NsReader::from_reader(message.body().as_ref());
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut text: Option<String> = None;

        loop {
            match reader.read_resolved_event_into(&mut buf)? {
                (ns, Event::Start(start))
                    if text.is_none()
                        && start.local_name().as_ref() == self.local_name.as_bytes()
                        && self.namespace_matches(&ns) =>
                {
                    text = Some(String::new());
                }
                (_, Event::Text(t)) => {
                    if let Some(text) = text.as_mut() {
                        text.push_str(&t.unescape()?);
                    }
                }
                (_, Event::CData(c)) => {
                    if let Some(text) = text.as_mut() {
                        text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                (_, Event::End(_)) if text.is_some() => {
                    return Ok(text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
                }
                (_, Event::Eof) => return Ok(None),
                _ => {}
            }
            buf.clear();
        }
    }
}

/// Value of an HTTP header.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    name: HeaderName,
}

impl HeaderExtractor {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }
}

impl SessionIdExtractor for HeaderExtractor {
    fn session_id(&self, message: &dyn Message) -> eyre::Result<Option<String>> {
        Ok(message
            .headers()
            .get(&self.name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string))
    }
}

/// Value of a cookie, read from `Cookie` on requests and `Set-Cookie` on
/// responses.
#[derive(Debug, Clone)]
pub struct CookieExtractor {
    name: String,
}

impl CookieExtractor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn find<'a>(&self, pairs: impl Iterator<Item = &'a str>) -> Option<String> {
        pairs
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.trim() == self.name)
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    }
}

impl SessionIdExtractor for CookieExtractor {
    fn session_id(&self, message: &dyn Message) -> eyre::Result<Option<String>> {
        let headers = message.headers();
        let from_cookie = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| self.find(v.split(';')));
        if from_cookie.is_some() {
            return Ok(from_cookie);
        }
        Ok(headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| self.find(v.split(';').take(1))))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response};

    use super::*;

    fn xml_request(body: &'static str) -> Request<Bytes> {
        Request::builder()
            .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    #[test]
    fn xml_extractor_reads_namespaced_element() {
        let extractor = XmlElementExtractor::new(
            Some("http://predic8.com/session/".into()),
            "session",
        );
        let req = xml_request(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
                 <soap:Header><s:session xmlns:s="http://predic8.com/session/"> 555 </s:session></soap:Header>
                 <soap:Body/>
               </soap:Envelope>"#,
        );
        assert_eq!(extractor.session_id(&req).unwrap().as_deref(), Some("555"));
    }

    #[test]
    fn xml_extractor_ignores_other_namespace_and_non_xml() {
        let extractor = XmlElementExtractor::new(Some("urn:expected".into()), "session");
        let req = xml_request(r#"<a xmlns:o="urn:other"><o:session>1</o:session></a>"#);
        assert_eq!(extractor.session_id(&req).unwrap(), None);

        let plain = Request::builder()
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Bytes::from_static(b"<session>1</session>"))
            .unwrap();
        assert_eq!(extractor.session_id(&plain).unwrap(), None);
    }

    #[test]
    fn xml_extractor_without_namespace_matches_local_name() {
        let extractor = XmlElementExtractor::new(None, "id");
        let req = xml_request("<r><x:id xmlns:x=\"urn:a\">a&amp;b</x:id></r>");
        assert_eq!(extractor.session_id(&req).unwrap().as_deref(), Some("a&b"));
    }

    #[test]
    fn header_extractor() {
        let extractor = HeaderExtractor::new(HeaderName::from_static("x-session"));
        let req = Request::builder()
            .header("x-session", "s-1")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(extractor.session_id(&req).unwrap().as_deref(), Some("s-1"));
    }

    #[test]
    fn cookie_extractor_reads_request_and_response() {
        let extractor = CookieExtractor::new("JSESSIONID");
        let req = Request::builder()
            .header(header::COOKIE, "theme=dark; JSESSIONID=abc123")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(extractor.session_id(&req).unwrap().as_deref(), Some("abc123"));

        let resp = Response::builder()
            .header(header::SET_COOKIE, "JSESSIONID=xyz; Path=/; HttpOnly")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(extractor.session_id(&resp).unwrap().as_deref(), Some("xyz"));
    }

    #[test]
    fn session_expiry() {
        let session = Session::new(Arc::new(Node::new("a", 1)));
        assert!(!session.is_expired(Duration::ZERO));
        assert!(!session.is_expired(Duration::from_secs(3600)));
    }
}
