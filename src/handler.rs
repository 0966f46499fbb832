use chrono::{TimeZone, Utc};

use crate::config::EndpointConfig;
use crate::mime::MimeMap;
use crate::parser::{HttpRequest, Method};
use crate::response::{status_message, Body, HttpResponse, MAX_FILE_SIZE};

/// RFC1123 date for the Date header.
fn http_date(timestamp: libc::time_t) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .unwrap()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn now() -> libc::time_t {
    Utc::now().timestamp()
}

/// Collapse a URL path segment by segment: empty and `.` segments vanish,
/// `..` pops the previous segment. A path that does not start with `/` or
/// that climbs above the root is rejected.
///
/// A trailing slash survives normalization so directory requests stay
/// distinguishable from file requests; the root is always `/`.
pub fn normalize_path(url: &str) -> Option<String> {
    if !url.starts_with('/') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in url.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            name => segments.push(name),
        }
    }
    let mut path = String::with_capacity(url.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if segments.is_empty() || url.ends_with('/') {
        path.push('/');
    }
    Some(path)
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encode everything outside the RFC3986 unreserved set.
pub fn url_encode(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for &byte in name.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push('%');
            encoded.push(HEX_DIGITS[usize::from(byte >> 4)] as char);
            encoded.push(HEX_DIGITS[usize::from(byte & 0xf)] as char);
        }
    }
    encoded
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

/// Decode %XX escapes to the bytes they represent. Anything that is not a
/// complete escape passes through untouched.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        if let Some(&[b'%', high, low]) = url.get(i..i + 3) {
            if let Some(byte) = hex_pair(high, low) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(url[i]);
        i += 1;
    }
    decoded
}

/// Escape text for embedding in HTML markup.
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&#x27;"),
            '"' => escaped.push_str("&#x22;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Push the headers every response carries.
fn base_headers(response: &mut HttpResponse, config: &EndpointConfig, close: bool) {
    response.add_header("Date", &http_date(now()));
    if !config.server_id.is_empty() {
        response.add_header("Server", &config.server_id);
    }
    if close {
        response.add_header("Connection", "close");
    } else {
        response.add_header("Connection", "keep-alive");
        response.add_header(
            "Keep-Alive",
            &format!("timeout={}", config.keepalive_timeout),
        );
    }
}

/// The page shell shared by error pages, redirects, and listings.
fn html_page(title: &str, contents: &str, server_id: &str) -> String {
    let mut page = String::with_capacity(contents.len() + 256);
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>");
    page.push_str(title);
    page.push_str("</title></head>\n<body>\n<h1>");
    page.push_str(title);
    page.push_str("</h1>\n");
    page.push_str(contents);
    if !server_id.is_empty() {
        page.push_str("<address>");
        page.push_str(&html_escape(server_id));
        page.push_str("</address>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}

fn page_response(config: &EndpointConfig, code: u16, page: String, close: bool) -> HttpResponse {
    let mut response = HttpResponse::new(code);
    base_headers(&mut response, config, close);
    response.add_header("Content-Length", &page.len().to_string());
    response.add_header("Content-Type", "text/html; charset=UTF-8");
    response.body = Body::Bytes(page.into_bytes());
    response.close = close;
    response
}

/// Standard HTML reply carrying a status code and one line of detail.
pub fn default_response(
    config: &EndpointConfig,
    code: u16,
    detail: &str,
    close: bool,
) -> HttpResponse {
    let title = format!("{} {}", code, status_message(code));
    let page = html_page(&title, &format!("<p>{}</p>\n", detail), &config.server_id);
    page_response(config, code, page, close)
}

/// Map a filesystem error onto the matching error reply.
fn io_error_response(
    config: &EndpointConfig,
    error: &std::io::Error,
    close: bool,
) -> HttpResponse {
    let (code, detail) = match error.kind() {
        std::io::ErrorKind::NotFound => (
            404,
            "the requested resource was not found on this server".to_string(),
        ),
        std::io::ErrorKind::PermissionDenied => (
            403,
            "access to the requested resource was denied".to_string(),
        ),
        _ => (500, format!("the request could not be completed: {}", error)),
    };
    default_response(config, code, &detail, close)
}

/// Point the client at `location` with a 301.
fn redirect(config: &EndpointConfig, location: &str, close: bool) -> HttpResponse {
    let contents = format!(
        "<p>The document has moved to <a href=\"{}\">{}</a>.</p>\n",
        location, location
    );
    let page = html_page("301 Moved Permanently", &contents, &config.server_id);
    let mut response = page_response(config, 301, page, close);
    response.add_header("Location", location);
    response
}

struct ListingRow {
    name: String,
    is_dir: bool,
    size: u64,
}

/// Collect the entries of a directory, directories first, names sorted.
/// Entries that cannot be examined are left out.
fn listing_rows(path: &str) -> std::io::Result<Vec<ListingRow>> {
    let mut rows = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        rows.push(ListingRow {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    rows.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(rows)
}

fn render_listing(rows: &[ListingRow]) -> String {
    let widest = rows
        .iter()
        .map(|row| row.name.chars().count())
        .max()
        .unwrap_or(0);
    let mut listing = String::from("<a href=\"../\">../</a>\n");
    for row in rows {
        let href = url_encode(&row.name);
        let label = html_escape(&row.name);
        if row.is_dir {
            listing.push_str(&format!("<a href=\"{}/\">{}/</a>\n", href, label));
        } else {
            listing.push_str(&format!(
                "<a href=\"{}\">{}</a>{:>width$}\n",
                href,
                label,
                row.size,
                width = widest - row.name.chars().count() + 12,
            ));
        }
    }
    listing
}

/// Render the directory contents as an HTML listing reply.
fn generate_dir_listing(
    config: &EndpointConfig,
    dir: &str,
    decoded_url: &str,
    close: bool,
) -> HttpResponse {
    let rows = match listing_rows(dir) {
        Ok(rows) => rows,
        Err(e) => return io_error_response(config, &e, close),
    };
    let contents = format!("<pre>\n{}</pre>\n", render_listing(&rows));
    let page = html_page(&html_escape(decoded_url), &contents, &config.server_id);
    page_response(config, 200, page, close)
}

/// Strip the query string and decode the request URI into a normalized path
/// under the document root. Errors are already full responses.
fn resolve_url(
    request: &HttpRequest,
    config: &EndpointConfig,
    close: bool,
) -> Result<String, HttpResponse> {
    let stripped = request.uri.splitn(2, '?').next().unwrap();
    String::from_utf8(url_decode(stripped))
        .ok()
        .and_then(|decoded| normalize_path(&decoded))
        .ok_or_else(|| default_response(config, 400, "the request path is not valid", close))
}

/// Synthesize a response for a parsed request against this endpoint's
/// document root.
pub fn handle_request(
    request: &HttpRequest,
    config: &EndpointConfig,
    mime: &MimeMap,
) -> HttpResponse {
    let close = request.close || !config.want_keepalive;
    match request.method {
        Method::Get => process_get(request, config, mime, close),
        Method::Post => process_post(request, config, close),
        Method::Delete => process_delete(request, config, close),
    }
}

/// Process a GET request: a file, an index, or a directory listing.
fn process_get(
    request: &HttpRequest,
    config: &EndpointConfig,
    mime: &MimeMap,
    close: bool,
) -> HttpResponse {
    let path = match resolve_url(request, config, close) {
        Ok(path) => path,
        Err(response) => return response,
    };
    if path.ends_with('/') {
        return serve_directory(&path, config, mime, close);
    }

    let target = format!("{}{}", config.root, path);
    match std::fs::metadata(&target) {
        Err(e) => io_error_response(config, &e, close),
        Ok(metadata) if metadata.is_dir() => {
            let stripped = request.uri.splitn(2, '?').next().unwrap();
            redirect(config, &format!("{}/", stripped), close)
        }
        Ok(metadata) if !metadata.is_file() => default_response(
            config,
            403,
            "the requested resource is not a regular file",
            close,
        ),
        Ok(metadata) => serve_file(
            &target,
            metadata.len(),
            mime.url_content_type(&path),
            config,
            close,
        ),
    }
}

/// A directory request: prefer its index file, fall back to a listing.
fn serve_directory(
    path: &str,
    config: &EndpointConfig,
    mime: &MimeMap,
    close: bool,
) -> HttpResponse {
    let index = format!("{}{}{}", config.root, path, config.index_name);
    if let Ok(metadata) = std::fs::metadata(&index) {
        if metadata.is_file() {
            return serve_file(
                &index,
                metadata.len(),
                mime.url_content_type(&config.index_name),
                config,
                close,
            );
        }
    }
    if config.no_listing {
        // Indistinguishable from a directory that does not exist.
        return default_response(
            config,
            404,
            "the requested resource was not found on this server",
            close,
        );
    }
    generate_dir_listing(config, &format!("{}{}", config.root, path), path, close)
}

/// A regular file: in one piece when it is small, chunked when it is not.
fn serve_file(
    target: &str,
    size: u64,
    mimetype: &str,
    config: &EndpointConfig,
    close: bool,
) -> HttpResponse {
    if size > MAX_FILE_SIZE {
        // Streamed; the send state opens its own handle to the file.
        let mut response = HttpResponse::new(200);
        base_headers(&mut response, config, close);
        response.add_header("Transfer-Encoding", "chunked");
        response.add_header("Content-Type", mimetype);
        response.body = Body::File {
            path: target.to_string(),
            size,
        };
        response.close = close;
        return response;
    }
    match std::fs::read(target) {
        Ok(body) => {
            let mut response = HttpResponse::new(200);
            base_headers(&mut response, config, close);
            response.add_header("Content-Length", &body.len().to_string());
            response.add_header("Content-Type", mimetype);
            response.body = Body::Bytes(body);
            response.close = close;
            response
        }
        Err(e) => io_error_response(config, &e, close),
    }
}

/// Process a POST request: store the body at the resolved path.
fn process_post(request: &HttpRequest, config: &EndpointConfig, close: bool) -> HttpResponse {
    let path = match resolve_url(request, config, close) {
        Ok(path) => path,
        Err(response) => return response,
    };
    let target = format!("{}{}", config.root, path);
    if path.ends_with('/') || std::fs::metadata(&target).map_or(false, |m| m.is_dir()) {
        return default_response(config, 403, "cannot write to a directory", close);
    }
    match std::fs::write(&target, &request.body) {
        Ok(()) => default_response(config, 201, "the upload was stored", close),
        Err(e) => io_error_response(config, &e, close),
    }
}

/// Process a DELETE request: unlink the resolved path.
fn process_delete(request: &HttpRequest, config: &EndpointConfig, close: bool) -> HttpResponse {
    let path = match resolve_url(request, config, close) {
        Ok(path) => path,
        Err(response) => return response,
    };
    let target = format!("{}{}", config.root, path);
    if std::fs::metadata(&target).map_or(false, |m| m.is_dir()) {
        return default_response(config, 403, "cannot delete a directory", close);
    }
    match std::fs::remove_file(&target) {
        Ok(()) => {
            let mut response = HttpResponse::new(204);
            base_headers(&mut response, config, close);
            response.add_header("Content-Length", "0");
            response.close = close;
            response
        }
        Err(e) => io_error_response(config, &e, close),
    }
}
