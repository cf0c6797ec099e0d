use portico::cgi::builder::CgiResponseBuilder;
use portico::cgi::parser::{CgiParseState, CgiParser, Framing, MAX_CGI_HEADER};
use portico::http::queue::ResponseQueue;
use portico::http::response::{ConnectionPolicy, StatusCode};

fn entry_text(queue: &mut ResponseQueue) -> String {
    String::from_utf8_lossy(queue.pop().unwrap().bytes()).to_string()
}

#[test]
fn test_content_length_output_round_trip() {
    let mut parser = CgiParser::new();
    parser.append(b"Status: 201 Created\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello");
    assert!(parser.parse(false));
    assert_eq!(parser.state(), CgiParseState::Done);

    let mut builder = CgiResponseBuilder::new();
    builder.apply(&mut parser);
    assert_eq!(builder.framing(), Framing::Length(5));

    let mut queue = ResponseQueue::new();
    builder.build_response(&mut queue, true);
    assert_eq!(queue.len(), 1);

    let text = entry_text(&mut queue);
    assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
}

#[test]
fn test_default_status_is_ok() {
    let mut parser = CgiParser::new();
    parser.append(b"Content-Type: text/html\r\nContent-Length: 0\r\n\r\n");
    assert!(parser.parse(false));
    assert_eq!(parser.status(), StatusCode::OK);
}

#[test]
fn test_first_status_wins() {
    let mut parser = CgiParser::new();
    parser.append(b"Status: 404 Not Found\r\nStatus: 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 0\r\n\r\n");
    parser.parse(false);
    assert_eq!(parser.status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_location_implies_found() {
    let mut parser = CgiParser::new();
    parser.append(b"Location: /elsewhere\r\nContent-Type: text/plain\r\nContent-Length: 0\r\n\r\n");
    parser.parse(false);
    assert_eq!(parser.status(), StatusCode::FOUND);
}

#[test]
fn test_missing_content_type_is_error() {
    let mut parser = CgiParser::new();
    parser.append(b"Content-Length: 2\r\n\r\nhi");
    assert!(parser.parse(false));
    assert_eq!(parser.state(), CgiParseState::Error);
    assert_eq!(parser.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn test_header_block_over_ceiling_is_error() {
    let mut parser = CgiParser::new();
    let mut junk = b"X-Filler: ".to_vec();
    junk.extend(std::iter::repeat_n(b'a', MAX_CGI_HEADER));
    parser.append(&junk);

    assert!(parser.parse(false));
    assert_eq!(parser.state(), CgiParseState::Error);
    assert_eq!(parser.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn test_header_line_with_leading_space_is_error() {
    let mut parser = CgiParser::new();
    parser.append(b"Content-Type: text/plain\r\n Folded: x\r\n\r\n");
    parser.parse(false);
    assert_eq!(parser.state(), CgiParseState::Error);
}

#[test]
fn test_truncated_body_at_eof_is_error() {
    let mut parser = CgiParser::new();
    parser.append(b"Content-Type: text/plain\r\nContent-Length: 10\r\n\r\nshort");
    assert!(!parser.parse(false));
    assert!(parser.parse(true));
    assert_eq!(parser.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn test_excess_body_is_tolerated() {
    let mut parser = CgiParser::new();
    parser.append(b"Content-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi there");
    assert!(parser.parse(false));
    assert_eq!(parser.state(), CgiParseState::Done);
    assert_eq!(parser.take_body(), b"hi".to_vec());
}

#[test]
fn test_streamed_output_is_chunked_for_the_client() {
    let mut parser = CgiParser::new();
    let mut builder = CgiResponseBuilder::new();
    builder.set_policy(ConnectionPolicy::WillClose);
    let mut queue = ResponseQueue::new();

    parser.append(b"Content-Type: text/plain\r\n\r\nhello");
    assert!(parser.parse(false));
    assert!(parser.is_streaming());
    assert!(
        parser
            .headers()
            .iter()
            .any(|(k, v)| k == "Transfer-Encoding" && v == "chunked")
    );
    builder.apply(&mut parser);
    builder.build_response(&mut queue, false);

    parser.append(b" world");
    parser.parse(false);
    builder.apply(&mut parser);
    builder.build_response(&mut queue, false);

    assert!(parser.parse(true));
    builder.apply(&mut parser);
    builder.build_response(&mut queue, true);
    assert!(builder.is_sent());

    let head = entry_text(&mut queue);
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(queue.pop().unwrap().bytes(), b"5\r\nhello\r\n");
    assert_eq!(queue.pop().unwrap().bytes(), b"6\r\n world\r\n");
    let last = queue.pop().unwrap();
    assert_eq!(last.bytes(), b"0\r\n\r\n");
    assert_eq!(last.policy(), ConnectionPolicy::WillClose);
    assert!(queue.is_empty());
}
