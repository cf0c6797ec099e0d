use url::Url;

use crate::http::response::{ConnectionPolicy, StatusCode};

/// HTTP request methods.
///
/// GET, POST and DELETE reach application logic. The others parse but are
/// answered with 405 Method Not Allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// GET - Retrieve a resource
    #[default]
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, typically uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use portico::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }

    /// Methods with application semantics on this server.
    pub fn is_supported(&self) -> bool {
        matches!(self, Method::GET | Method::POST | Method::DELETE)
    }
}

/// Headers whose values may legitimately contain commas and therefore must
/// never be split into lists.
const LIST_UNSAFE: &[&str] = &[
    "set-cookie",
    "cookie",
    "date",
    "expires",
    "last-modified",
    "if-modified-since",
    "if-unmodified-since",
    "retry-after",
    "user-agent",
    "authorization",
    "proxy-authorization",
    "www-authenticate",
    "proxy-authenticate",
    "content-type",
    "content-disposition",
    "host",
    "referer",
    "location",
];

/// Case-insensitive header map from name to value list.
///
/// Repeated fields and comma-separated values of list-valued headers are
/// collected in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one header field as it appeared on the wire.
    pub fn append(&mut self, name: &str, value: &str) {
        let values: Vec<String> = if is_list_unsafe(name) {
            vec![value.trim().to_string()]
        } else {
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        };

        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => existing.extend(values),
            None => self.entries.push((name.to_string(), values)),
        }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `name` was present at all, even with an empty value.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Whether any value of `name` equals `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).iter().any(|v| v.eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

fn is_list_unsafe(name: &str) -> bool {
    LIST_UNSAFE.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Represents a parsed HTTP request from a client.
///
/// `target` is the request-target exactly as received; `path` and `query`
/// are its normalized components.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Raw request-target
    pub target: String,
    /// Normalized path with dot segments removed
    pub path: String,
    /// Query string without the leading `?`
    pub query: Option<String>,
    /// HTTP version (`HTTP/1.1` or `HTTP/1.0`)
    pub version: String,
    pub headers: HeaderMap,
    /// Decoded request body
    pub body: Vec<u8>,
    /// Set when parsing failed; the response to send
    pub status: Option<StatusCode>,
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// defaults to close unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }

    /// Policy for the response to this request.
    pub fn connection_policy(&self) -> ConnectionPolicy {
        if self.status.is_some() {
            ConnectionPolicy::MustClose
        } else if self.keep_alive() {
            ConnectionPolicy::KeepAlive
        } else {
            ConnectionPolicy::WillClose
        }
    }
}

/// Splits a request-target into a normalized path and optional query.
///
/// Accepts origin-form (`/a/b?x`), absolute-form (`http://h/a`) and the
/// asterisk form. Returns `None` for anything else.
///
/// # Example
///
/// ```
/// # use portico::http::request::split_target;
/// let (path, query) = split_target("/a/../b/./c?x=1").unwrap();
/// assert_eq!(path, "/b/c");
/// assert_eq!(query.as_deref(), Some("x=1"));
/// ```
pub fn split_target(target: &str) -> Option<(String, Option<String>)> {
    if target == "*" {
        return Some(("*".to_string(), None));
    }

    let url = if target.starts_with('/') {
        if target.starts_with("//") {
            return None;
        }
        let base = Url::parse("http://localhost/").ok()?;
        base.join(target).ok()?
    } else if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target).ok()?
    } else {
        return None;
    };

    Some((url.path().to_string(), url.query().map(str::to_string)))
}

/// Builder for constructing Request objects.
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<String>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Request-target; path and query are derived from it.
    pub fn path(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(&key.into(), &value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let target = self.target.ok_or("path missing")?;
        let (path, query) = split_target(&target).ok_or("invalid target")?;
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            target,
            path,
            query,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
            status: None,
        })
    }
}
