use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};

pub const CHUNK_SIZE: usize = 8192;
/// Files up to this size are sent in one Content-Length response; larger
/// files are streamed with chunked transfer-encoding.
pub const MAX_FILE_SIZE: u64 = 16384;

/// Reason phrase for a status code.
pub fn status_message(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// Response payload as produced by the request handler.
#[derive(Debug)]
pub enum Body {
    Bytes(Vec<u8>),
    File { path: String, size: u64 },
}

/// A response the handler synthesized; not yet tied to a connection.
#[derive(Debug)]
pub struct HttpResponse {
    pub code: u16,
    pub message: String,
    /// Ordered; serialized exactly as pushed.
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub close: bool,
}

impl HttpResponse {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            message: status_message(code).to_string(),
            headers: Vec::new(),
            body: Body::Bytes(Vec::new()),
            close: false,
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Status line and header block, terminated by the blank line.
    pub fn header_block(&self) -> Vec<u8> {
        let mut block = format!("HTTP/1.1 {} {}\r\n", self.code, self.message);
        for (name, value) in &self.headers {
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        block.push_str("\r\n");
        block.into_bytes()
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Some bytes moved; more work remains.
    Progress,
    /// The socket is full; resume on the next writable event.
    WouldBlock,
    /// Every byte of the response has been sent.
    Finished,
    /// The client is considered lost.
    Error,
}

/// Per-connection send progress. Small responses carry the full serialized
/// bytes; large responses stream a file as chunked transfer-encoding.
#[derive(Debug)]
pub enum ResponseState {
    Small {
        bytes: Vec<u8>,
        sent: usize,
        close: bool,
    },
    Large {
        headers: Vec<u8>,
        headers_sent: usize,
        header_done: bool,
        file: File,
        file_size: u64,
        file_read: u64,
        chunk: Vec<u8>,
        chunk_sent: usize,
        terminated: bool,
        close: bool,
    },
}

impl ResponseState {
    /// Turn a handler response into send state. Opening the file for a large
    /// response can fail; the caller downgrades that to a 500.
    pub fn from_response(response: HttpResponse) -> std::io::Result<ResponseState> {
        let close = response.close;
        let header_block = response.header_block();
        Ok(match response.body {
            Body::Bytes(body) => {
                let mut bytes = header_block;
                bytes.extend_from_slice(&body);
                ResponseState::Small {
                    bytes,
                    sent: 0,
                    close,
                }
            }
            Body::File { path, size } => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path)?;
                ResponseState::Large {
                    headers: header_block,
                    headers_sent: 0,
                    header_done: false,
                    file,
                    file_size: size,
                    file_read: 0,
                    chunk: Vec::new(),
                    chunk_sent: 0,
                    terminated: false,
                    close,
                }
            }
        })
    }

    pub fn close_after_send(&self) -> bool {
        match self {
            ResponseState::Small { close, .. } => *close,
            ResponseState::Large { close, .. } => *close,
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            ResponseState::Small { bytes, sent, .. } => *sent >= bytes.len(),
            ResponseState::Large {
                header_done,
                terminated,
                chunk,
                chunk_sent,
                ..
            } => *header_done && *terminated && *chunk_sent >= chunk.len(),
        }
    }

    /// One send attempt against the client socket. Never blocks; cursors stay
    /// in place on EAGAIN so the next writable event resumes exactly here.
    pub fn write_some(&mut self, fd: RawFd) -> SendOutcome {
        match self {
            ResponseState::Small { bytes, sent, .. } => {
                match send_some(fd, &bytes[*sent..]) {
                    Sent::Bytes(n) => {
                        *sent += n;
                        if *sent >= bytes.len() {
                            SendOutcome::Finished
                        } else {
                            SendOutcome::Progress
                        }
                    }
                    Sent::WouldBlock => SendOutcome::WouldBlock,
                    Sent::Error => SendOutcome::Error,
                }
            }
            ResponseState::Large {
                headers,
                headers_sent,
                header_done,
                file,
                file_size,
                file_read,
                chunk,
                chunk_sent,
                terminated,
                ..
            } => {
                if !*header_done {
                    return match send_some(fd, &headers[*headers_sent..]) {
                        Sent::Bytes(n) => {
                            *headers_sent += n;
                            if *headers_sent >= headers.len() {
                                *header_done = true;
                            }
                            SendOutcome::Progress
                        }
                        Sent::WouldBlock => SendOutcome::WouldBlock,
                        Sent::Error => SendOutcome::Error,
                    };
                }

                // Refill the chunk once the previous one is fully out.
                if *chunk_sent >= chunk.len() {
                    if *terminated {
                        return SendOutcome::Finished;
                    }
                    if *file_read < *file_size {
                        // Never read past the advertised size, even if the
                        // file grew since the headers were built.
                        let want = (*file_size - *file_read).min(CHUNK_SIZE as u64) as usize;
                        let mut buf = [0; CHUNK_SIZE];
                        match file.read(&mut buf[..want]) {
                            Ok(0) => {
                                // File shrank underneath us; end the stream.
                                *terminated = true;
                                *chunk = b"0\r\n\r\n".to_vec();
                            }
                            Ok(n) => {
                                *file_read += n as u64;
                                *chunk = frame_chunk(&buf[..n]);
                            }
                            Err(_) => return SendOutcome::Error,
                        }
                    } else {
                        *terminated = true;
                        *chunk = b"0\r\n\r\n".to_vec();
                    }
                    *chunk_sent = 0;
                }

                match send_some(fd, &chunk[*chunk_sent..]) {
                    Sent::Bytes(n) => {
                        *chunk_sent += n;
                        if *terminated && *chunk_sent >= chunk.len() {
                            SendOutcome::Finished
                        } else {
                            SendOutcome::Progress
                        }
                    }
                    Sent::WouldBlock => SendOutcome::WouldBlock,
                    Sent::Error => SendOutcome::Error,
                }
            }
        }
    }
}

/// Frame one chunk as `<hex-length>CRLF<payload>CRLF`.
fn frame_chunk(data: &[u8]) -> Vec<u8> {
    let mut chunk = format!("{:x}\r\n", data.len()).into_bytes();
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

enum Sent {
    Bytes(usize),
    WouldBlock,
    Error,
}

fn send_some(fd: RawFd, buf: &[u8]) -> Sent {
    match socket::send(fd, buf, MsgFlags::MSG_NOSIGNAL) {
        Ok(n) if n > 0 => Sent::Bytes(n),
        Ok(_) => Sent::Error,
        Err(Errno::EAGAIN) => Sent::WouldBlock,
        Err(_) => Sent::Error,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;
    use test_case::test_case;

    #[test_case(200, "OK")]
    #[test_case(404, "Not Found")]
    #[test_case(504, "Gateway Timeout")]
    #[test_case(999, "")]
    fn status_message_works(code: u16, expected: &str) {
        assert_eq!(status_message(code), expected);
    }

    #[test]
    fn header_block_is_ordered() {
        let mut response = HttpResponse::new(200);
        response.add_header("Date", "today");
        response.add_header("Content-Length", "0");
        assert_eq!(
            response.header_block(),
            b"HTTP/1.1 200 OK\r\nDate: today\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn frame_chunk_works() {
        assert_eq!(frame_chunk(b"hello"), b"5\r\nhello\r\n");
        assert_eq!(frame_chunk(&[0; 8192])[..6], *b"2000\r\n");
    }

    fn pair() -> (i32, i32) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .expect("failed to create socketpair")
    }

    fn drain(fd: i32, into: &mut Vec<u8>) {
        let mut buf = [0; 4096];
        loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => into.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
    }

    fn dechunk(mut data: &[u8]) -> (Vec<usize>, Vec<u8>) {
        let mut sizes = Vec::new();
        let mut body = Vec::new();
        loop {
            let pos = data.windows(2).position(|w| w == b"\r\n").unwrap();
            let size =
                usize::from_str_radix(std::str::from_utf8(&data[..pos]).unwrap(), 16).unwrap();
            data = &data[pos + 2..];
            if size == 0 {
                assert_eq!(data, b"\r\n");
                return (sizes, body);
            }
            sizes.push(size);
            body.extend_from_slice(&data[..size]);
            assert_eq!(&data[size..size + 2], b"\r\n");
            data = &data[size + 2..];
        }
    }

    #[test]
    fn small_response_sends_completely() {
        let (local, peer) = pair();
        let mut response = HttpResponse::new(200);
        response.add_header("Content-Length", "2");
        response.body = Body::Bytes(b"hi".to_vec());
        let mut state = ResponseState::from_response(response).unwrap();

        let mut received = Vec::new();
        loop {
            match state.write_some(local) {
                SendOutcome::Finished => break,
                SendOutcome::WouldBlock => drain(peer, &mut received),
                SendOutcome::Progress => {}
                SendOutcome::Error => panic!("send failed"),
            }
        }
        assert!(state.is_finished());
        drain(peer, &mut received);
        assert_eq!(
            received,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"
        );
        close(local).unwrap();
        close(peer).unwrap();
    }

    #[test]
    fn large_response_streams_file_in_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).unwrap();

        let mut response = HttpResponse::new(200);
        response.add_header("Transfer-Encoding", "chunked");
        response.body = Body::File {
            path: file.path().to_str().unwrap().to_string(),
            size: payload.len() as u64,
        };
        let mut state = ResponseState::from_response(response).unwrap();

        let (local, peer) = pair();
        let mut received = Vec::new();
        loop {
            match state.write_some(local) {
                SendOutcome::Finished => break,
                SendOutcome::WouldBlock => drain(peer, &mut received),
                SendOutcome::Progress => {}
                SendOutcome::Error => panic!("send failed"),
            }
        }
        assert!(state.is_finished());
        drain(peer, &mut received);

        let header_end = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let headers = std::str::from_utf8(&received[..header_end]).unwrap();
        assert!(headers.contains("Transfer-Encoding: chunked"));
        let (sizes, body) = dechunk(&received[header_end + 4..]);
        assert_eq!(sizes, vec![8192, 8192, 3616]);
        assert_eq!(body, payload);
        close(local).unwrap();
        close(peer).unwrap();
    }

    #[test]
    fn missing_file_fails_to_become_send_state() {
        let mut response = HttpResponse::new(200);
        response.body = Body::File {
            path: "/nonexistent/file".to_string(),
            size: 1,
        };
        assert!(ResponseState::from_response(response).is_err());
    }
}
