use portico::http::parser::{ParseError, ParseState, RequestParser, MAX_TARGET};
use portico::http::request::{Method, Request};
use portico::http::response::{ConnectionPolicy, StatusCode};

/// Parses one request from the start of `buf`, returning it with the number
/// of bytes it occupied.
fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut parser = RequestParser::new();
    parser.append(buf);
    if !parser.parse() {
        return Err(ParseError::Incomplete);
    }
    if let Some(error) = parser.error() {
        return Err(error);
    }
    let consumed = buf.len() - parser.buffered();
    Ok((parser.take_request(), consumed))
}

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.path, "/");
    assert_eq!(parsed.version, "HTTP/1.1");
    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_post_request_with_body() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.path, "/api");
    assert_eq!(parsed.body, b"hello".to_vec());
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_request_splits_query_string() {
    let req = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.target, "/search?q=rust");
    assert_eq!(parsed.path, "/search");
    assert_eq!(parsed.query.as_deref(), Some("q=rust"));
}

#[test]
fn test_parse_removes_dot_segments() {
    let req = b"GET /a/b/../c/./d.html HTTP/1.1\r\nHost: x\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.path, "/a/c/d.html");
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_incomplete_request_partial_body() {
    let req = b"POST /api HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nhello";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_unknown_method_is_not_implemented() {
    let req = b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::UnsupportedMethod)));
    assert_eq!(ParseError::UnsupportedMethod.status(), StatusCode::NOT_IMPLEMENTED);
}

#[test]
fn test_parse_garbage_method_is_bad_request() {
    let req = b"G(T / HTTP/1.1\r\nHost: x\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidMethod)));
}

#[test]
fn test_parse_unsupported_version() {
    let req = b"GET / HTTP/2.0\r\nHost: x\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::UnsupportedVersion)));
    assert_eq!(
        ParseError::UnsupportedVersion.status(),
        StatusCode::HTTP_VERSION_NOT_SUPPORTED
    );
}

#[test]
fn test_parse_target_too_long() {
    let req = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(MAX_TARGET + 1));
    let result = parse_http_request(req.as_bytes());

    assert!(matches!(result, Err(ParseError::UriTooLong)));
    assert_eq!(ParseError::UriTooLong.status(), StatusCode::URI_TOO_LONG);
}

#[test]
fn test_parse_endless_request_line_without_terminator() {
    let mut parser = RequestParser::new();
    parser.append(b"GET /");
    parser.append("a".repeat(9000).as_bytes());

    assert!(parser.parse());
    assert!(parser.is_error());
    assert_eq!(parser.error(), Some(ParseError::UriTooLong));
    assert_eq!(parser.request().status, Some(StatusCode::URI_TOO_LONG));
}

#[test]
fn test_parse_http11_requires_host() {
    let req = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::MissingHost)));
}

#[test]
fn test_parse_http10_without_host() {
    let req = b"GET / HTTP/1.0\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.version, "HTTP/1.0");
    assert!(!parsed.keep_alive());
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nHost: x\r\nBrokenHeader\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_conflicting_content_length() {
    let req = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd";
    assert!(matches!(
        parse_http_request(req),
        Err(ParseError::InvalidContentLength)
    ));
}

#[test]
fn test_parse_unknown_transfer_encoding() {
    let req = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n";
    assert!(matches!(
        parse_http_request(req),
        Err(ParseError::UnsupportedTransferEncoding)
    ));
}

#[test]
fn test_parse_chunked_request_body() {
    let req = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.body, b"Wikipedia".to_vec());
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\nHost: x\r\n\r\n", method_str);
        let (parsed, _) = parse_http_request(req.as_bytes()).unwrap();
        assert_eq!(parsed.method, expected_method);
    }
}

#[test]
fn test_parse_request_with_binary_body() {
    let req = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.body, vec![0, 1, 2, 3]);
}

#[test]
fn test_parser_keeps_pipelined_bytes_across_clear() {
    let mut parser = RequestParser::new();
    parser.append(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(parser.parse());
    assert_eq!(parser.take_request().path, "/one");

    parser.clear();
    assert_eq!(parser.state(), ParseState::Header);
    assert!(parser.parse());
    assert_eq!(parser.take_request().path, "/two");
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn test_parser_waits_for_body_across_appends() {
    let mut parser = RequestParser::new();
    parser.append(b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 6\r\n\r\nabc");
    assert!(!parser.parse());

    parser.append(b"def");
    assert!(parser.parse());
    assert!(parser.is_done());
    assert_eq!(parser.request().body, b"abcdef".to_vec());
}

#[test]
fn test_parse_error_forces_must_close() {
    let mut parser = RequestParser::new();
    parser.append(b"GET / HTTP/1.1\r\n\r\n");

    assert!(parser.parse());
    let request = parser.take_request();
    assert_eq!(request.status, Some(StatusCode::BAD_REQUEST));
    assert_eq!(request.connection_policy(), ConnectionPolicy::MustClose);
}
