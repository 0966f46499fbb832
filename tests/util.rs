use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        ::std::collections::HashMap::from([$(($k, $v),)*])
    };
}

pub fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

pub fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before we
        // start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_emberhttpd"))
            .args(&[
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server")
            .into();

        let server = Self {
            _child: child,
            port,
            root,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        server
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str) -> File {
        File::create(self.root().join(name)).expect("failed to create file")
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) {
        self.create_file(name)
            .write_all(contents)
            .expect("failed to write file");
    }

    /// Drop an executable script into the document root.
    pub fn write_script(&self, name: &str, contents: &str) {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("failed to write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }

    pub fn stream(&self) -> TcpStream {
        self.stream_with_timeout(Duration::from_secs(2))
    }

    pub fn stream_with_timeout(&self, timeout: Duration) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream.set_read_timeout(Some(timeout)).unwrap();
        stream.set_write_timeout(Some(timeout)).unwrap();
        stream
    }

    /// One request, one framed response.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<&str, &str>,
        body: &[u8],
    ) -> Response {
        let mut stream = self.stream();
        write!(stream, "{} {} HTTP/1.1\r\n", method, path).unwrap();
        write!(stream, "Host: 127.0.0.1\r\n").unwrap();
        for (header_name, header_value) in headers {
            write!(stream, "{}: {}\r\n", header_name, header_value).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        stream.write_all(body).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        self.request("GET", path, headers, b"")
    }
}

/// HTTP response as read off the wire.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Sizes of the data chunks, for chunked responses only.
    pub chunk_sizes: Option<Vec<usize>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let mut chunk_sizes = None;
        let body = if headers.get("Transfer-Encoding").map(String::as_str) == Some("chunked") {
            let (sizes, body) = Self::read_chunked_body(reader)?;
            chunk_sizes = Some(sizes);
            Some(body)
        } else {
            headers
                .get("Content-Length")
                .map(|length| length.parse::<usize>().expect("invalid content length"))
                .map(|length| Self::read_body(reader, length))
                .transpose()?
        };
        Ok(Self {
            response_line,
            headers,
            body,
            chunk_sizes,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    fn read_chunked_body<R: Read>(reader: &mut R) -> io::Result<(Vec<usize>, Vec<u8>)> {
        let mut sizes = Vec::new();
        let mut body = Vec::new();
        loop {
            let size_line = Self::read_header(reader)?;
            let size = usize::from_str_radix(&size_line, 16).expect("invalid chunk size");
            if size == 0 {
                // terminating CRLF after the last-chunk line
                let mut crlf = [0; 2];
                reader.read_exact(&mut crlf)?;
                assert_eq!(&crlf, b"\r\n");
                return Ok((sizes, body));
            }
            sizes.push(size);
            let mut chunk = vec![0; size];
            reader.read_exact(&mut chunk)?;
            body.extend_from_slice(&chunk);
            let mut crlf = [0; 2];
            reader.read_exact(&mut crlf)?;
            assert_eq!(&crlf, b"\r\n");
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
