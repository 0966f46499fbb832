use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType, SockaddrIn,
};
use nix::unistd::close;

use crate::cgi::{self, CgiState, CGI_MAX_OUTPUT_BYTES};
use crate::config::EndpointConfig;
use crate::handler;
use crate::log::{Level, Logger};
use crate::mime::MimeMap;
use crate::parser::{self, Method, Parse, Phase};
use crate::reactor::{Direction, Reactor};
use crate::response::{Body, HttpResponse, ResponseState, SendOutcome};

pub const BUFFER_SIZE: usize = 8192;
pub const LISTEN_BACKLOG: usize = 128;
/// Listen handle of an endpoint that failed to start.
pub const INVALID_SOCKET: RawFd = -1;

/// Per-connection parse state, owned by exactly one Endpoint for the life of
/// the client socket.
#[derive(Debug)]
pub struct ClientState {
    pub fd: RawFd,
    pub peer: String,
    pub buffer: Vec<u8>,
    pub phase: Phase,
    pub last_active: Instant,
    pub request_count: u64,
}

impl ClientState {
    fn new(fd: RawFd, peer: String) -> Self {
        Self {
            fd,
            peer,
            buffer: Vec::new(),
            phase: Phase::AwaitingRequestLine,
            last_active: Instant::now(),
            request_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Ready the connection for the next keepalive request. Bytes beyond the
    /// current request are dropped; pipelining is not supported.
    fn reset(&mut self) {
        self.buffer.clear();
        self.phase = Phase::AwaitingRequestLine;
    }

    fn timed_out(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }
}

/// One listening socket and everything scoped to it: client states, response
/// states, and CGI children. Every fd in these maps is owned here and closed
/// exactly once.
#[derive(Debug)]
pub struct Endpoint {
    pub config: EndpointConfig,
    pub listen_fd: RawFd,
    pub clients: HashMap<RawFd, ClientState>,
    pub responses: HashMap<RawFd, ResponseState>,
    pub cgi: HashMap<RawFd, CgiState>,
}

impl Endpoint {
    /// Create the listening socket. A failure leaves the endpoint unusable
    /// rather than taking the process down; the EndpointSet skips it.
    pub fn new(config: EndpointConfig, logger: &mut Logger) -> Self {
        let listen_fd = match create_listen_socket(&config) {
            Ok(fd) => {
                logger.log(
                    Level::Info,
                    &format!("listening on http://{}:{}/", config.addr, config.port),
                );
                fd
            }
            Err(e) => {
                logger.log(
                    Level::Error,
                    &format!(
                        "failed to listen on {}:{}: {}",
                        config.addr, config.port, e
                    ),
                );
                INVALID_SOCKET
            }
        };
        Self {
            config,
            listen_fd,
            clients: HashMap::new(),
            responses: HashMap::new(),
            cgi: HashMap::new(),
        }
    }

    pub fn usable(&self) -> bool {
        self.listen_fd != INVALID_SOCKET
    }

    /// Accept one connection from the listen socket.
    pub fn accept_connection(&mut self, reactor: &mut Reactor, logger: &mut Logger) {
        let fd = match socket::accept4(
            self.listen_fd,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                // Failed to accept, but keep serving existing connections.
                logger.log(Level::Warn, &format!("accept() failed: {}", e));
                return;
            }
        };

        if self.config.max_connections > 0 && self.clients.len() >= self.config.max_connections {
            logger.log(
                Level::Warn,
                &format!("connection limit reached, answering fd {} with 503", fd),
            );
            let response = handler::default_response(
                &self.config,
                503,
                "The server is handling too many connections. Try again later.",
                true,
            );
            self.install_response(fd, response, reactor, logger);
            return;
        }

        let peer = peer_name(fd);
        logger.log(
            Level::Debug,
            &format!("accepted connection from {} on fd {}", peer, fd),
        );
        self.clients.insert(fd, ClientState::new(fd, peer));
        if let Err(e) = reactor.register(fd, Direction::Read) {
            logger.log(
                Level::Warn,
                &format!("failed to register fd {} for read: {}", fd, e),
            );
        }
    }

    /// Drain readable client bytes into the parse buffer and act on the
    /// parser's verdict.
    pub fn handle_client_read(
        &mut self,
        fd: RawFd,
        reactor: &mut Reactor,
        mime: &MimeMap,
        logger: &mut Logger,
    ) {
        let mut buf = [0; BUFFER_SIZE];
        let received = match socket::recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                self.handle_client_disconnection(fd, reactor, logger);
                return;
            }
            Ok(received) => received,
            Err(Errno::EAGAIN) => return,
            Err(e) => {
                logger.log(Level::Error, &format!("recv on fd {} failed: {}", fd, e));
                self.handle_client_disconnection(fd, reactor, logger);
                return;
            }
        };

        let parse = {
            let client = match self.clients.get_mut(&fd) {
                Some(client) => client,
                None => return,
            };
            client.touch();
            client.buffer.extend_from_slice(&buf[..received]);
            let parse = parser::parse_request(&client.buffer);
            match &parse {
                Parse::Incomplete(phase) => client.phase = *phase,
                Parse::Complete { consumed, .. } => {
                    client.phase = Phase::RequestReady;
                    client.request_count += 1;
                    client.buffer.drain(..*consumed);
                }
                Parse::Failed { .. } => {}
            }
            parse
        };

        match parse {
            Parse::Incomplete(_) => {}
            Parse::Complete { request, .. } => self.process_request(fd, request, reactor, mime, logger),
            Parse::Failed { status, detail } => {
                logger.log(
                    Level::Warn,
                    &format!("bad request on fd {}: {} ({})", fd, status, detail),
                );
                self.handle_invalid_request(fd, status, &detail, reactor, logger);
            }
        }
    }

    /// Route a complete request to CGI or the static handler.
    fn process_request(
        &mut self,
        fd: RawFd,
        request: parser::HttpRequest,
        reactor: &mut Reactor,
        mime: &MimeMap,
        logger: &mut Logger,
    ) {
        if let Some(script) = self.cgi_target(&request) {
            self.handle_cgi_request(fd, &script, reactor, logger);
            return;
        }

        let response = handler::handle_request(&request, &self.config, mime);
        let bytes_sent = match &response.body {
            Body::Bytes(body) => body.len(),
            Body::File { size, .. } => *size as usize,
        };
        if let Some(client) = self.clients.get_mut(&fd) {
            let peer = client.peer.clone();
            logger.access(
                &peer,
                request.method.as_str(),
                &request.uri,
                response.code,
                bytes_sent,
            );
            // Reset before the response is installed so no stale parse state
            // can trigger a second response on this connection.
            client.reset();
        }
        self.install_response(fd, response, reactor, logger);
    }

    /// The path of the CGI executable this request addresses, if it is a CGI
    /// request at all: extension registered, under /cgi-bin, file exists.
    fn cgi_target(&self, request: &parser::HttpRequest) -> Option<String> {
        if !self.config.cgi_enabled {
            return None;
        }
        if !matches!(request.method, Method::Get | Method::Post) {
            return None;
        }
        let stripped = request.uri.splitn(2, '?').next().unwrap();
        let decoded = String::from_utf8(handler::url_decode(stripped)).ok()?;
        let safe = handler::normalize_path(&decoded)?;
        if !safe.starts_with("/cgi-bin/") {
            return None;
        }
        let extension = format!(".{}", safe.rsplit('.').next()?);
        if safe.rsplit('/').next()?.find('.').is_none()
            || !self.config.cgi_extensions.contains(&extension)
        {
            return None;
        }
        let target = format!("{}{}", self.config.root, safe);
        match std::fs::metadata(&target) {
            Ok(metadata) if metadata.is_file() => Some(target),
            _ => None,
        }
    }

    /// Spawn the CGI child and start draining its pipe.
    fn handle_cgi_request(
        &mut self,
        fd: RawFd,
        script: &str,
        reactor: &mut Reactor,
        logger: &mut Logger,
    ) {
        match cgi::spawn(script) {
            Ok((pid, pipe_fd)) => {
                logger.log(
                    Level::Info,
                    &format!("spawned CGI {} as pid {} for fd {}", script, pid, fd),
                );
                if let Err(e) = reactor.register(pipe_fd, Direction::Read) {
                    // The sweep converts this into a 504 eventually.
                    logger.log(
                        Level::Warn,
                        &format!("failed to register CGI pipe fd {}: {}", pipe_fd, e),
                    );
                }
                self.cgi.insert(pipe_fd, CgiState::new(pid, pipe_fd, fd));
            }
            Err(e) => {
                logger.log(Level::Error, &format!("CGI spawn failed: {}", e));
                self.handle_invalid_request(
                    fd,
                    500,
                    "The server failed to launch the CGI program.",
                    reactor,
                    logger,
                );
            }
        }
    }

    /// Drain readable bytes from a CGI pipe; EOF completes the response.
    pub fn handle_cgi_output(&mut self, pipe_fd: RawFd, reactor: &mut Reactor, logger: &mut Logger) {
        let mut buf = [0; BUFFER_SIZE];
        match nix::unistd::read(pipe_fd, &mut buf) {
            Err(Errno::EAGAIN) => {}
            Err(e) => {
                logger.log(
                    Level::Error,
                    &format!("read from CGI pipe fd {} failed: {}", pipe_fd, e),
                );
                // No response is synthesized; the keepalive sweep will retire
                // the client. The pipe and the child must not leak though.
                if let Some(state) = self.cgi.remove(&pipe_fd) {
                    reactor.unregister(pipe_fd, Direction::Read);
                    close(pipe_fd).ok();
                    cgi::kill_and_reap(state.pid);
                }
            }
            Ok(0) => {
                // Child finished writing.
                let state = match self.cgi.remove(&pipe_fd) {
                    Some(state) => state,
                    None => return,
                };
                reactor.unregister(pipe_fd, Direction::Read);
                close(pipe_fd).ok();
                cgi::reap(state.pid);
                logger.log(
                    Level::Info,
                    &format!(
                        "CGI pid {} finished with {} output bytes",
                        state.pid,
                        state.output.len()
                    ),
                );

                let mut response = HttpResponse::new(200);
                response.add_header("Content-Length", &state.output.len().to_string());
                response.add_header("Content-Type", "text/plain");
                if !self.config.server_id.is_empty() {
                    response.add_header("Server", &self.config.server_id);
                }
                response.add_header("Connection", "keep-alive");
                response.body = Body::Bytes(state.output);

                if self.clients.contains_key(&state.client_fd) {
                    if let Some(client) = self.clients.get_mut(&state.client_fd) {
                        client.reset();
                    }
                    self.install_response(state.client_fd, response, reactor, logger);
                }
            }
            Ok(received) => {
                let overflowed = match self.cgi.get_mut(&pipe_fd) {
                    Some(state) => {
                        state.output.extend_from_slice(&buf[..received]);
                        state.output.len() > CGI_MAX_OUTPUT_BYTES
                    }
                    None => return,
                };
                if overflowed {
                    logger.log(
                        Level::Warn,
                        &format!("CGI on pipe fd {} exceeded the output limit", pipe_fd),
                    );
                    if let Some(state) = self.cgi.remove(&pipe_fd) {
                        reactor.unregister(pipe_fd, Direction::Read);
                        close(pipe_fd).ok();
                        cgi::kill_and_reap(state.pid);
                        self.handle_invalid_request(
                            state.client_fd,
                            500,
                            "The CGI output exceeded the maximum allowed size of 2 MiB and was terminated.",
                            reactor,
                            logger,
                        );
                    }
                }
            }
        }
    }

    /// Drive the send state machine for one writable event.
    pub fn handle_client_write(&mut self, fd: RawFd, reactor: &mut Reactor, logger: &mut Logger) {
        let outcome = match self.responses.get_mut(&fd) {
            Some(state) => state.write_some(fd),
            None => {
                logger.log(
                    Level::Error,
                    &format!("no response state for writable fd {}", fd),
                );
                reactor.unregister(fd, Direction::Write);
                return;
            }
        };
        match outcome {
            SendOutcome::Progress | SendOutcome::WouldBlock => {}
            SendOutcome::Finished => {
                reactor.unregister(fd, Direction::Write);
                if let Some(state) = self.responses.remove(&fd) {
                    assert!(state.is_finished());
                    if state.close_after_send() {
                        self.remove_client(fd, reactor);
                        close(fd).ok();
                        logger.log(Level::Debug, &format!("closed fd {} after response", fd));
                    }
                }
            }
            SendOutcome::Error => {
                logger.log(Level::Error, &format!("failed to send response to fd {}", fd));
                reactor.unregister(fd, Direction::Write);
                if let Some(state) = self.responses.remove(&fd) {
                    if !self.clients.contains_key(&fd) {
                        // Detached response; the fd is ours to close.
                        close(fd).ok();
                    } else if state.close_after_send() {
                        self.remove_client(fd, reactor);
                        close(fd).ok();
                    }
                    // An attached keepalive client stays; the peer's EOF or
                    // the idle sweep retires it.
                }
            }
        }
    }

    /// Answer a protocol or gateway error and give the response ownership of
    /// the close: the client state is detached here and the connection closes
    /// once the error response has flushed.
    fn handle_invalid_request(
        &mut self,
        fd: RawFd,
        status: u16,
        detail: &str,
        reactor: &mut Reactor,
        logger: &mut Logger,
    ) {
        if self.remove_client(fd, reactor).is_none() {
            logger.log(
                Level::Warn,
                &format!("no client state for invalid request on fd {}", fd),
            );
            return;
        }
        let response = handler::default_response(&self.config, status, detail, true);
        self.install_response(fd, response, reactor, logger);
    }

    /// Turn a handler response into send state keyed by the client fd and ask
    /// for writable events. A file that no longer opens downgrades to a 500.
    fn install_response(
        &mut self,
        fd: RawFd,
        response: HttpResponse,
        reactor: &mut Reactor,
        logger: &mut Logger,
    ) {
        let state = match ResponseState::from_response(response) {
            Ok(state) => state,
            Err(e) => {
                logger.log(Level::Error, &format!("failed to open response file: {}", e));
                let fallback = handler::default_response(
                    &self.config,
                    500,
                    "The file could not be opened.",
                    true,
                );
                // An in-memory response cannot fail to build.
                match ResponseState::from_response(fallback) {
                    Ok(state) => state,
                    Err(_) => return,
                }
            }
        };
        self.responses.insert(fd, state);
        if let Err(e) = reactor.register(fd, Direction::Write) {
            logger.log(
                Level::Warn,
                &format!("failed to register fd {} for write: {}", fd, e),
            );
        }
    }

    /// Detach the client state from the connection: stop reading, forget the
    /// parse state. The caller decides what happens to the fd.
    fn remove_client(&mut self, fd: RawFd, reactor: &mut Reactor) -> Option<ClientState> {
        let client = self.clients.remove(&fd)?;
        reactor.unregister(fd, Direction::Read);
        Some(client)
    }

    /// The peer is gone: retire the client, any in-flight response, and any
    /// CGI child working for it, then close the socket.
    pub fn handle_client_disconnection(
        &mut self,
        fd: RawFd,
        reactor: &mut Reactor,
        logger: &mut Logger,
    ) {
        if let Some(client) = self.remove_client(fd, reactor) {
            logger.log(
                Level::Debug,
                &format!(
                    "client {} on fd {} disconnected after {} requests",
                    client.peer, fd, client.request_count
                ),
            );
        }
        if self.responses.remove(&fd).is_some() {
            reactor.unregister(fd, Direction::Write);
        }
        let pipes: Vec<RawFd> = self
            .cgi
            .iter()
            .filter(|(_, state)| state.client_fd == fd)
            .map(|(pipe_fd, _)| *pipe_fd)
            .collect();
        for pipe_fd in pipes {
            if let Some(state) = self.cgi.remove(&pipe_fd) {
                reactor.unregister(pipe_fd, Direction::Read);
                close(pipe_fd).ok();
                cgi::kill_and_reap(state.pid);
            }
        }
        close(fd).ok();
    }

    /// Disconnect clients whose keepalive idle time is up.
    pub fn sweep_clients(&mut self, reactor: &mut Reactor, logger: &mut Logger) {
        if self.config.keepalive_timeout == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.config.keepalive_timeout);
        let stale: Vec<(RawFd, Phase)> = self
            .clients
            .values()
            .filter(|client| client.timed_out(timeout))
            .map(|client| (client.fd, client.phase))
            .collect();
        for (fd, phase) in stale {
            logger.log(
                Level::Info,
                &format!("client on fd {} timed out in phase {:?}", fd, phase),
            );
            self.handle_client_disconnection(fd, reactor, logger);
        }
    }

    /// Kill CGI children that have overstayed and answer their clients 504.
    pub fn sweep_cgi(&mut self, reactor: &mut Reactor, logger: &mut Logger) {
        let timeout = Duration::from_secs(self.config.cgi_timeout);
        let stale: Vec<RawFd> = self
            .cgi
            .values()
            .filter(|state| state.timed_out(timeout))
            .map(|state| state.pipe_fd)
            .collect();
        for pipe_fd in stale {
            if let Some(state) = self.cgi.remove(&pipe_fd) {
                logger.log(
                    Level::Warn,
                    &format!("CGI pid {} timed out and is being killed", state.pid),
                );
                reactor.unregister(pipe_fd, Direction::Read);
                close(pipe_fd).ok();
                cgi::kill_and_reap(state.pid);
                self.handle_invalid_request(
                    state.client_fd,
                    504,
                    "The CGI program did not complete in time.",
                    reactor,
                    logger,
                );
            }
        }
    }

    /// Tear everything down: children killed, every owned fd unregistered and
    /// closed exactly once.
    pub fn shutdown(&mut self, reactor: &mut Reactor, logger: &mut Logger) {
        for (pipe_fd, state) in self.cgi.drain() {
            reactor.unregister(pipe_fd, Direction::Read);
            close(pipe_fd).ok();
            cgi::kill_and_reap(state.pid);
        }
        let mut to_close = HashSet::new();
        for (fd, _) in self.clients.drain() {
            reactor.unregister(fd, Direction::Read);
            to_close.insert(fd);
        }
        for (fd, _) in self.responses.drain() {
            reactor.unregister(fd, Direction::Write);
            to_close.insert(fd);
        }
        for fd in to_close {
            close(fd).ok();
        }
        if self.listen_fd != INVALID_SOCKET {
            reactor.unregister(self.listen_fd, Direction::Read);
            close(self.listen_fd).ok();
            self.listen_fd = INVALID_SOCKET;
        }
        logger.log(
            Level::Info,
            &format!(
                "endpoint {}:{} shut down",
                self.config.addr, self.config.port
            ),
        );
    }
}

fn create_listen_socket(config: &EndpointConfig) -> nix::Result<RawFd> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )?;
    let addr = SockaddrIn::from(SocketAddrV4::new(config.addr, config.port));
    let result = socket::setsockopt(fd, sockopt::ReuseAddr, &true)
        .and_then(|_| socket::bind(fd, &addr))
        .and_then(|_| socket::listen(fd, LISTEN_BACKLOG));
    if let Err(e) = result {
        close(fd).ok();
        return Err(e);
    }
    Ok(fd)
}

/// Peer address for logging; the port is not interesting.
fn peer_name(fd: RawFd) -> String {
    match socket::getpeername::<SockaddrIn>(fd) {
        Ok(addr) => {
            let addr = addr.to_string();
            match addr.rsplit_once(':') {
                Some((host, _port)) => host.to_string(),
                None => addr,
            }
        }
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::Ipv4Addr;

    use crate::log::LogSink;
    use crate::parser::parse_request;

    fn test_logger() -> Logger {
        Logger::new(LogSink::Stdout, Level::Error)
    }

    fn test_config(root: &str) -> EndpointConfig {
        EndpointConfig {
            addr: Ipv4Addr::LOCALHOST,
            port: 0,
            root: root.to_string(),
            keepalive_timeout: 30,
            cgi_enabled: true,
            cgi_extensions: vec![".sh".to_string()],
            cgi_timeout: 10,
            max_connections: 0,
            index_name: "index.html".to_string(),
            no_listing: false,
            want_keepalive: true,
            server_id: "emberhttpd/test".to_string(),
        }
    }

    fn get(uri: &str) -> parser::HttpRequest {
        let text = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", uri);
        match parse_request(text.as_bytes()) {
            Parse::Complete { request, .. } => request,
            other => panic!("test request did not parse: {:?}", other),
        }
    }

    #[test]
    fn endpoint_with_unbindable_address_is_unusable() {
        let mut config = test_config("/var/empty");
        // TEST-NET-3; nothing local to bind to.
        config.addr = Ipv4Addr::new(203, 0, 113, 1);
        let endpoint = Endpoint::new(config, &mut test_logger());
        assert!(!endpoint.usable());
        assert_eq!(endpoint.listen_fd, INVALID_SOCKET);
    }

    #[test]
    fn cgi_target_requires_extension_directory_and_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("cgi-bin")).unwrap();
        std::fs::write(root.path().join("cgi-bin/hello.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::write(root.path().join("cgi-bin/hello.py"), b"#!/usr/bin/env python3\n").unwrap();
        std::fs::write(root.path().join("top.sh"), b"#!/bin/sh\n").unwrap();

        let mut endpoint =
            Endpoint::new(test_config(root.path().to_str().unwrap()), &mut test_logger());
        assert!(endpoint.usable());

        let expected = format!("{}/cgi-bin/hello.sh", root.path().to_str().unwrap());
        assert_eq!(endpoint.cgi_target(&get("/cgi-bin/hello.sh")), Some(expected.clone()));
        // query strings do not defeat the match
        assert_eq!(
            endpoint.cgi_target(&get("/cgi-bin/hello.sh?name=x")),
            Some(expected)
        );
        // unregistered extension
        assert_eq!(endpoint.cgi_target(&get("/cgi-bin/hello.py")), None);
        // outside /cgi-bin
        assert_eq!(endpoint.cgi_target(&get("/top.sh")), None);
        // no such file
        assert_eq!(endpoint.cgi_target(&get("/cgi-bin/missing.sh")), None);
        // disabled entirely
        endpoint.config.cgi_enabled = false;
        assert_eq!(endpoint.cgi_target(&get("/cgi-bin/hello.sh")), None);

        let mut reactor = Reactor::new().unwrap();
        endpoint.shutdown(&mut reactor, &mut test_logger());
    }
}
