use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, INVALID_SOCKET};
use crate::log::{Level, Logger};
use crate::mime::MimeMap;
use crate::reactor::{Direction, Event, Reactor};

pub const SERVER_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_TIMEOUT_MS: isize = 1000;

/// Owns every endpoint and the reactor, and runs the event loop.
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    reactor: Reactor,
    mime: MimeMap,
    logger: Logger,
    last_sweep: Instant,
}

impl EndpointSet {
    /// Build the endpoints and register their listen sockets. Individual
    /// endpoints may fail and are skipped; having none at all is fatal, as is
    /// a reactor setup failure.
    pub fn new(configs: Vec<EndpointConfig>, mime: MimeMap, mut logger: Logger) -> Result<Self> {
        let mut reactor = Reactor::new()?;
        let mut endpoints = Vec::new();
        for config in configs {
            let endpoint = Endpoint::new(config, &mut logger);
            if endpoint.usable() {
                if let Err(e) = reactor.register(endpoint.listen_fd, Direction::Read) {
                    logger.log(
                        Level::Error,
                        &format!("failed to register listen socket: {}", e),
                    );
                }
            }
            endpoints.push(endpoint);
        }
        if !endpoints.iter().any(Endpoint::usable) {
            return Err(anyhow!("no endpoint could be started"));
        }
        Ok(Self {
            endpoints,
            reactor,
            mime,
            logger,
            last_sweep: Instant::now(),
        })
    }

    /// Main loop: sweep, wait, dispatch, until the shutdown flag flips.
    pub fn run(&mut self) {
        while crate::is_running() {
            self.iterate();
        }
        self.shutdown();
    }

    fn iterate(&mut self) {
        if self.last_sweep.elapsed() >= SERVER_TIMEOUT_CHECK_INTERVAL {
            self.sweep();
            self.last_sweep = Instant::now();
        }

        let events = match self.reactor.wait(WAIT_TIMEOUT_MS) {
            Ok(events) => events,
            Err(e) => {
                // Scoped errors never get here; a reactor error is logged and
                // the loop carries on.
                self.logger.log(Level::Error, &format!("reactor wait failed: {}", e));
                return;
            }
        };

        // Two passes: every read lands before any write. A request completed
        // in this batch has its response installed before the write pass
        // looks for work, and a write never observes a client that a read in
        // the same batch is about to drop.
        for event in &events {
            if event.readable || event.end_of_stream {
                Self::dispatch_read(
                    &mut self.endpoints,
                    &mut self.reactor,
                    &self.mime,
                    &mut self.logger,
                    event,
                );
            }
        }
        for event in &events {
            if event.writable || event.end_of_stream {
                Self::dispatch_write(&mut self.endpoints, &mut self.reactor, &mut self.logger, event);
            }
        }
    }

    /// Find the endpoint owning this fd as a listen socket, client, or CGI
    /// pipe. Handles already retired earlier in the batch simply match
    /// nothing.
    fn dispatch_read(
        endpoints: &mut [Endpoint],
        reactor: &mut Reactor,
        mime: &MimeMap,
        logger: &mut Logger,
        event: &Event,
    ) {
        for endpoint in endpoints.iter_mut() {
            if endpoint.listen_fd != INVALID_SOCKET && event.fd == endpoint.listen_fd {
                endpoint.accept_connection(reactor, logger);
                return;
            }
            if endpoint.clients.contains_key(&event.fd) {
                if event.end_of_stream {
                    endpoint.handle_client_disconnection(event.fd, reactor, logger);
                } else {
                    endpoint.handle_client_read(event.fd, reactor, mime, logger);
                }
                return;
            }
            if endpoint.cgi.contains_key(&event.fd) {
                endpoint.handle_cgi_output(event.fd, reactor, logger);
                return;
            }
        }
    }

    fn dispatch_write(
        endpoints: &mut [Endpoint],
        reactor: &mut Reactor,
        logger: &mut Logger,
        event: &Event,
    ) {
        for endpoint in endpoints.iter_mut() {
            if endpoint.responses.contains_key(&event.fd) {
                endpoint.handle_client_write(event.fd, reactor, logger);
                return;
            }
        }
    }

    fn sweep(&mut self) {
        for endpoint in self.endpoints.iter_mut() {
            endpoint.sweep_clients(&mut self.reactor, &mut self.logger);
            endpoint.sweep_cgi(&mut self.reactor, &mut self.logger);
        }
    }

    fn shutdown(&mut self) {
        self.logger.log(Level::Info, "shutting down");
        for endpoint in self.endpoints.iter_mut() {
            endpoint.shutdown(&mut self.reactor, &mut self.logger);
        }
    }
}
