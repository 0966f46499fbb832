// To prevent a malformed request from eating up too much memory, die once the
// header section exceeds this many bytes:
pub const MAX_HEADER_BYTES: usize = 8192;
pub const MAX_URI_BYTES: usize = 2048;
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Request methods the server implements. Anything else is answered 501.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// A fully parsed request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    /// Header fields in arrival order, original casing preserved.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// True when the client asked for the connection to be closed after the
    /// response (Connection: close, or HTTP/1.0 without keep-alive).
    pub close: bool,
}

impl HttpRequest {
    /// First value for a header field, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// How far an incomplete request has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRequestLine,
    AwaitingHeaders,
    AwaitingBody,
    RequestReady,
}

/// Outcome of running the parser over the accumulated buffer.
#[derive(Debug)]
pub enum Parse {
    /// Need more bytes; the connection keeps reading.
    Incomplete(Phase),
    /// A full request; `consumed` bytes of the buffer belong to it.
    Complete { request: HttpRequest, consumed: usize },
    /// Protocol error to be answered with `status` and then close.
    Failed { status: u16, detail: String },
}

fn fail(status: u16, detail: &str) -> Parse {
    Parse::Failed {
        status,
        detail: detail.to_string(),
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse the accumulated request bytes. Pure over the buffer: callers append
/// and re-invoke; nothing is remembered between calls.
pub fn parse_request(buf: &[u8]) -> Parse {
    let header_end = match find(b"\r\n\r\n", buf) {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_HEADER_BYTES {
                return fail(400, "Request Header Or Cookie Too Large");
            }
            let phase = if find(b"\r\n", buf).is_some() {
                Phase::AwaitingHeaders
            } else {
                Phase::AwaitingRequestLine
            };
            return Parse::Incomplete(phase);
        }
    };
    if header_end + 4 > MAX_HEADER_BYTES {
        return fail(400, "Request Header Or Cookie Too Large");
    }

    let text = match std::str::from_utf8(&buf[..header_end]) {
        Ok(text) => text,
        Err(_) => return fail(400, "request contains invalid bytes"),
    };
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let tokens: Vec<&str> = request_line.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() != 3 {
        return fail(400, "malformed request line");
    }
    let method = match Method::from_token(tokens[0]) {
        Some(method) => method,
        None => return fail(501, "the method you specified is not implemented"),
    };
    let uri = tokens[1];
    if !uri.contains('/') {
        return fail(400, "request URI must contain a slash");
    }
    if uri.len() > MAX_URI_BYTES {
        return fail(414, "Request-URI Too Large");
    }
    let version = match parse_version(tokens[2]) {
        Ok(version) => version,
        Err(parse) => return parse,
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut host_count = 0;
    for line in lines {
        if line.is_empty() {
            return fail(400, "empty header field line");
        }
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => return fail(400, "header field without a colon"),
        };
        if name.is_empty() || name.contains(' ') || name.contains('\t') {
            return fail(400, "whitespace in header field name");
        }
        if name.eq_ignore_ascii_case("host") {
            host_count += 1;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    match host_count {
        0 => return fail(400, "Host header is required"),
        1 => {}
        _ => return fail(400, "duplicate Host header"),
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    };

    let content_length = match header("content-length") {
        Some(value) => match value.parse::<usize>() {
            Ok(length) => Some(length),
            Err(_) => return fail(400, "invalid Content-Length"),
        },
        None => None,
    };
    let chunked = match header("transfer-encoding") {
        Some(value) if value.eq_ignore_ascii_case("chunked") => true,
        Some(_) => return fail(501, "transfer encoding not implemented"),
        None => false,
    };

    if method == Method::Get && (content_length.unwrap_or(0) > 0 || chunked) {
        return fail(400, "Invalid GET Request (with body indicators)");
    }
    if method == Method::Post && content_length.is_none() && !chunked {
        return fail(411, "Length Required");
    }

    let body_start = header_end + 4;
    let (body, consumed) = if chunked {
        match decode_chunked(&buf[body_start..]) {
            Chunked::Incomplete => return Parse::Incomplete(Phase::AwaitingBody),
            Chunked::Failed { status, detail } => return fail(status, &detail),
            Chunked::Done { body, consumed } => (body, body_start + consumed),
        }
    } else {
        let length = content_length.unwrap_or(0);
        if length > MAX_BODY_BYTES {
            return fail(413, "Request Entity Too Large");
        }
        if buf.len() < body_start + length {
            return Parse::Incomplete(Phase::AwaitingBody);
        }
        (buf[body_start..body_start + length].to_vec(), body_start + length)
    };

    let close = match header("connection").map(str::to_ascii_lowercase) {
        Some(connection) if connection == "close" => true,
        Some(connection) if connection == "keep-alive" => false,
        _ => version == "HTTP/1.0",
    };

    Parse::Complete {
        request: HttpRequest {
            method,
            uri: uri.to_string(),
            version,
            headers,
            body,
            close,
        },
        consumed,
    }
}

/// Validate `HTTP/<major>.<minor>`. A token that is not shaped like an HTTP
/// version at all is a 400; a well-formed version we don't speak is a 505.
fn parse_version(token: &str) -> Result<String, Parse> {
    let rest = match token.strip_prefix("HTTP/") {
        Some(rest) => rest,
        None => return Err(fail(400, "malformed protocol version")),
    };
    if !rest.contains('.') {
        return Err(fail(400, "malformed protocol version"));
    }
    let digits: Vec<char> = rest.chars().collect();
    if digits.len() != 3
        || !digits[0].is_ascii_digit()
        || digits[1] != '.'
        || !digits[2].is_ascii_digit()
        || digits[0] != '1'
    {
        return Err(fail(505, "HTTP Version Not Supported"));
    }
    Ok(token.to_string())
}

enum Chunked {
    Incomplete,
    Done { body: Vec<u8>, consumed: usize },
    Failed { status: u16, detail: String },
}

/// De-chunk a request body. `data` starts right after the header section.
fn decode_chunked(data: &[u8]) -> Chunked {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = match find(b"\r\n", &data[pos..]) {
            Some(end) => end,
            None => {
                // A chunk-size line is a few hex digits; anything longer is
                // not going to become one.
                if data.len() - pos > 18 {
                    return Chunked::Failed {
                        status: 400,
                        detail: "malformed chunk size".to_string(),
                    };
                }
                return Chunked::Incomplete;
            }
        };
        let size_field = &data[pos..pos + line_end];
        let size_text = match std::str::from_utf8(size_field) {
            Ok(text) => text.split(';').next().unwrap_or("").trim(),
            Err(_) => {
                return Chunked::Failed {
                    status: 400,
                    detail: "malformed chunk size".to_string(),
                }
            }
        };
        let size = match usize::from_str_radix(size_text, 16) {
            Ok(size) => size,
            Err(_) => {
                return Chunked::Failed {
                    status: 400,
                    detail: "malformed chunk size".to_string(),
                }
            }
        };
        pos += line_end + 2;
        if size == 0 {
            // Trailer fields are not supported; the terminating chunk must be
            // followed directly by CRLF.
            return match data.get(pos..pos + 2) {
                Some(b"\r\n") => Chunked::Done {
                    body,
                    consumed: pos + 2,
                },
                Some(_) => Chunked::Failed {
                    status: 400,
                    detail: "chunked trailers are not supported".to_string(),
                },
                None => Chunked::Incomplete,
            };
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Chunked::Failed {
                status: 413,
                detail: "Request Entity Too Large".to_string(),
            };
        }
        if data.len() < pos + size + 2 {
            return Chunked::Incomplete;
        }
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return Chunked::Failed {
                status: 400,
                detail: "chunk data not terminated by CRLF".to_string(),
            };
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn parse(text: &[u8]) -> Parse {
        parse_request(text)
    }

    fn assert_failed(parse: Parse, status: u16) {
        match parse {
            Parse::Failed { status: got, .. } => assert_eq!(got, status),
            other => panic!("expected failure with {}, got {:?}", status, other),
        }
    }

    #[test]
    fn simple_get_works() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        match parse(request) {
            Parse::Complete { request, consumed } => {
                assert_eq!(request.method, Method::Get);
                assert_eq!(request.uri, "/index.html");
                assert_eq!(request.version, "HTTP/1.1");
                assert_eq!(request.header("host"), Some("example.com"));
                assert!(request.body.is_empty());
                assert!(!request.close);
                assert_eq!(consumed, 47);
            }
            other => panic!("expected complete request, got {:?}", other),
        }
    }

    #[test]
    fn post_with_content_length_works() {
        let request = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        match parse(request) {
            Parse::Complete { request, consumed } => {
                assert_eq!(request.method, Method::Post);
                assert_eq!(request.body, b"hello");
                assert_eq!(consumed, 58);
            }
            other => panic!("expected complete request, got {:?}", other),
        }
    }

    #[test]
    fn post_with_chunked_body_works() {
        let request =
            b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        match parse(request) {
            Parse::Complete { request, consumed } => {
                assert_eq!(request.body, b"hello world");
                assert_eq!(consumed, 88);
            }
            other => panic!("expected complete request, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_phases_are_reported() {
        assert!(matches!(
            parse(b"GET / HT"),
            Parse::Incomplete(Phase::AwaitingRequestLine)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Parse::Incomplete(Phase::AwaitingHeaders)
        ));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhel"),
            Parse::Incomplete(Phase::AwaitingBody)
        ));
    }

    #[test_case(b"GIT / HTTP/1.1\r\nHost: x\r\n\r\n", 501 ; "unknown method")]
    #[test_case(b"GET / HTTP/1.1\r\n\r\n", 400 ; "missing host")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\nHost: y\r\n\r\n", 400 ; "duplicate host")]
    #[test_case(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", 505 ; "major version")]
    #[test_case(b"GET / HTTP/1.12\r\nHost: x\r\n\r\n", 505 ; "long minor version")]
    #[test_case(b"GET / HTTQ/1.1\r\nHost: x\r\n\r\n", 400 ; "not http at all")]
    #[test_case(b"GET /\r\nHost: x\r\n\r\n", 400 ; "missing version token")]
    #[test_case(b"GET noslash HTTP/1.1\r\nHost: x\r\n\r\n", 400 ; "uri without slash")]
    #[test_case(b"GET / HTTP/1.1\r\nBad Name: x\r\nHost: x\r\n\r\n", 400 ; "space in header name")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc", 400 ; "get with body")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n", 400 ; "get chunked")]
    #[test_case(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n", 411 ; "post without framing")]
    #[test_case(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: ten\r\n\r\n", 400 ; "bad content length")]
    #[test_case(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n", 501 ; "unknown transfer encoding")]
    fn invalid_requests_fail(request: &[u8], status: u16) {
        assert_failed(parse(request), status);
    }

    #[test]
    fn get_with_zero_content_length_is_allowed() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(parse(request), Parse::Complete { .. }));
    }

    #[test]
    fn http_1_0_defaults_to_close() {
        let request = b"GET / HTTP/1.0\r\nHost: x\r\n\r\n";
        match parse(request) {
            Parse::Complete { request, .. } => assert!(request.close),
            other => panic!("expected complete request, got {:?}", other),
        }
        let request = b"GET / HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
        match parse(request) {
            Parse::Complete { request, .. } => assert!(!request.close),
            other => panic!("expected complete request, got {:?}", other),
        }
    }

    #[test]
    fn connection_close_is_honored() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        match parse(request) {
            Parse::Complete { request, .. } => assert!(request.close),
            other => panic!("expected complete request, got {:?}", other),
        }
    }

    #[test]
    fn header_section_boundary() {
        // Exactly MAX_HEADER_BYTES is accepted.
        let padding = MAX_HEADER_BYTES - 36;
        let request = format!(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: {}\r\n\r\n",
            "a".repeat(padding)
        );
        assert_eq!(request.len(), MAX_HEADER_BYTES);
        assert!(matches!(parse(request.as_bytes()), Parse::Complete { .. }));

        // One more byte is rejected.
        let request = format!(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: {}\r\n\r\n",
            "a".repeat(padding + 1)
        );
        assert_failed(parse(request.as_bytes()), 400);
    }

    #[test]
    fn oversized_partial_header_is_rejected() {
        let fragment = vec![b'a'; MAX_HEADER_BYTES + 1];
        assert_failed(parse(&fragment), 400);
    }

    #[test]
    fn uri_too_long_is_rejected() {
        let request = format!(
            "GET /{} HTTP/1.1\r\nHost: x\r\n\r\n",
            "u".repeat(MAX_URI_BYTES)
        );
        assert_failed(parse(request.as_bytes()), 414);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let request = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert_failed(parse(request.as_bytes()), 413);
    }

    #[test]
    fn consumed_excludes_pipelined_bytes() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /next HTTP/1.1\r\n";
        match parse(request) {
            Parse::Complete { consumed, .. } => assert_eq!(consumed, 27),
            other => panic!("expected complete request, got {:?}", other),
        }
    }
}
