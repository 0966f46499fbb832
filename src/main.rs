use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

mod cgi;
mod config;
mod endpoint;
mod handler;
mod log;
mod mime;
mod parser;
mod reactor;
mod response;
mod server;

use config::EndpointConfig;
use log::{Level, LogSink, Logger};
use mime::MimeMap;
use server::EndpointSet;

const DEFAULT_INDEX_NAME: &str = "index.html";
const DEFAULT_KEEPALIVE_TIMEOUT: u64 = 30;
const DEFAULT_CGI_TIMEOUT: u64 = 10;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

pub(crate) fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/wwwroot [flags]\n\n\
        flags:\t--port number (default: 8080)\n\
        \t\tSpecifies which port to listen on for connections.\n\n\
        \t--addr ip (default: all)\n\
        \t\tIf multiple interfaces are present, specifies\n\
        \t\twhich one to bind the listening port to.\n\n\
        \t--listen addr:port[:root]\n\
        \t\tAdds another listening endpoint. The root defaults to\n\
        \t\tthe wwwroot given as the first argument. The option\n\
        \t\tmay be specified multiple times.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t--cgi-ext .extension\n\
        \t\tTreats files with this extension under /cgi-bin as CGI\n\
        \t\tprograms. The option may be specified multiple times.\n\n\
        \t--cgi-timeout secs (default: {})\n\
        \t\tKills CGI programs that run for longer than this.\n\n\
        \t--no-cgi\n\
        \t\tDisables CGI even if extensions were given.\n\n\
        \t--maxconn number (default: unlimited)\n\
        \t\tSpecifies how many concurrent connections to accept\n\
        \t\tper endpoint; beyond it, connections are answered 503.\n\n\
        \t--index filename (default: {})\n\
        \t\tDefault file to serve when a directory is requested.\n\n\
        \t--no-listing\n\
        \t\tDo not serve listing if directory is requested.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: {})\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for the log.\n\n\
        \t--debug\n\
        \t\tLog debug messages as well.\n\n\
        \t--quiet\n\
        \t\tOnly log warnings and errors.\n\n\
        \t--no-keepalive\n\
        \t\tDisables HTTP Keep-Alive functionality.\n\n\
        \t--no-server-id\n\
        \t\tDon't identify the server type in headers\n\
        \t\tor directory listings.\n\n",
        argv0,
        DEFAULT_KEEPALIVE_TIMEOUT,
        DEFAULT_CGI_TIMEOUT,
        DEFAULT_INDEX_NAME,
        mime::DEFAULT_MIME_TYPE,
    );
}

fn parse_commandline() -> Result<(Vec<EndpointConfig>, MimeMap, Logger)> {
    let mut args = std::env::args();

    let name = args.next().expect("expected at least one argument");

    let mut wwwroot = match args.next().as_deref() {
        None | Some("--help") => {
            usage(&name); // no wwwroot given
            std::process::exit(0);
        }
        Some(wwwroot) => wwwroot.to_string(),
    };
    // Strip ending slash.
    if wwwroot.ends_with('/') {
        wwwroot.pop();
    }

    let mut addr = Ipv4Addr::UNSPECIFIED;
    let mut port = 8080;
    let mut listens: Vec<(Ipv4Addr, u16, String)> = Vec::new();
    let mut keepalive_timeout = DEFAULT_KEEPALIVE_TIMEOUT;
    let mut cgi_extensions: Vec<String> = Vec::new();
    let mut cgi_timeout = DEFAULT_CGI_TIMEOUT;
    let mut no_cgi = false;
    let mut max_connections = 0;
    let mut index_name = DEFAULT_INDEX_NAME.to_string();
    let mut no_listing = false;
    let mut want_keepalive = true;
    let mut want_server_id = true;
    let mut mime_map = MimeMap::parse_default_extension_map();
    let mut log_sink = LogSink::Stdout;
    let mut min_level = Level::Info;

    while let Some(arg) = args.next().as_deref() {
        match arg {
            "--port" => {
                let number = args.next().context("missing number after --port")?;
                port = number
                    .parse()
                    .with_context(|| format!("port number {} is invalid", number))?;
            }
            "--addr" => {
                let ip = args.next().context("missing ip after --addr")?;
                addr =
                    Ipv4Addr::from_str(&ip).map_err(|_| anyhow!("address {} is invalid", ip))?;
            }
            "--listen" => {
                let spec = args.next().context("missing addr:port after --listen")?;
                listens.push(config::parse_listen_spec(&spec, &wwwroot)?);
            }
            "--timeout" => {
                let number = args.next().context("missing number after --timeout")?;
                keepalive_timeout = number
                    .parse()
                    .with_context(|| format!("timeout number {} is invalid", number))?;
            }
            "--cgi-ext" => {
                let extension = args.next().context("missing extension after --cgi-ext")?;
                if !extension.starts_with('.') {
                    return Err(anyhow!("extension `{}' must start with a dot", extension));
                }
                cgi_extensions.push(extension);
            }
            "--cgi-timeout" => {
                let number = args.next().context("missing number after --cgi-timeout")?;
                cgi_timeout = number
                    .parse()
                    .with_context(|| format!("cgi-timeout number {} is invalid", number))?;
            }
            "--no-cgi" => no_cgi = true,
            "--maxconn" => {
                let number = args.next().context("missing number after --maxconn")?;
                max_connections = number
                    .parse()
                    .with_context(|| format!("maxconn number {} is invalid", number))?;
            }
            "--index" => {
                index_name = args.next().context("missing filename after --index")?;
            }
            "--no-listing" => no_listing = true,
            "--mimetypes" => {
                let filename = args.next().context("missing filename after --mimetypes")?;
                mime_map
                    .parse_extension_map_file(&OsString::from(&filename))
                    .unwrap_or_else(|e| abort!("failed to read {}: {}", filename, e));
            }
            "--default-mimetype" => {
                mime_map.default_mimetype = args
                    .next()
                    .context("missing string after --default-mimetype")?;
            }
            "--log" => {
                let filename = args.next().context("missing filename after --log")?;
                log_sink = LogSink::File(BufWriter::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .with_context(|| format!("failed to open log file {}", filename))?,
                ));
            }
            "--syslog" => log_sink = LogSink::Syslog,
            "--debug" => min_level = Level::Debug,
            "--quiet" => min_level = Level::Warn,
            "--no-keepalive" => want_keepalive = false,
            "--no-server-id" => want_server_id = false,
            _ => {
                return Err(anyhow!("unknown argument `{}'", arg));
            }
        }
    }

    let server_id = if want_server_id {
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    } else {
        String::new()
    };

    let endpoint = |addr, port, root| EndpointConfig {
        addr,
        port,
        root,
        keepalive_timeout,
        cgi_enabled: !no_cgi && !cgi_extensions.is_empty(),
        cgi_extensions: cgi_extensions.clone(),
        cgi_timeout,
        max_connections,
        index_name: index_name.clone(),
        no_listing,
        want_keepalive,
        server_id: server_id.clone(),
    };

    let mut configs = vec![endpoint(addr, port, wwwroot)];
    for (addr, port, root) in listens {
        configs.push(endpoint(addr, port, root));
    }

    Ok((configs, mime_map, Logger::new(log_sink, min_level)))
}

fn main() -> Result<()> {
    println!("{}/{}.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let (configs, mime_map, logger) = parse_commandline()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut endpoints = EndpointSet::new(configs, mime_map, logger)?;
    endpoints.run();

    Ok(())
}
