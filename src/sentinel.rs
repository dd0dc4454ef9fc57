use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::commands::Command;
use crate::connection::default_timeout;
use crate::frame::{self, Frame};
use crate::Error;

const DEFAULT_PORT: u16 = 6379;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A parsed configuration string:
/// `host:port[,host:port...][,serviceName=NAME][,key=value...]`.
///
/// The presence of `serviceName` switches endpoint selection from
/// direct-connect to sentinel discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoints: Vec<String>,
    pub service_name: Option<String>,
    /// Client name announced via CLIENT SETNAME when supported.
    pub name: Option<String>,
    /// Initial logical database.
    pub db: u32,
    /// Per-request deadline budget.
    pub timeout: Duration,
    /// Unrecognized `key=value` pairs, preserved for callers.
    pub options: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            endpoints: Vec::new(),
            service_name: None,
            name: None,
            db: 0,
            timeout: default_timeout(),
            options: HashMap::new(),
        }
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Config, Error> {
        let mut config = Config::default();

        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some(("serviceName", value)) => config.service_name = Some(value.to_string()),
                Some(("name", value)) => config.name = Some(value.to_string()),
                Some(("db", value)) => {
                    config.db = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid db option {value:?}"))
                    })?;
                }
                Some(("timeout", value)) => {
                    let millis: u64 = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid timeout option {value:?}"))
                    })?;
                    config.timeout = Duration::from_millis(millis);
                }
                Some((key, value)) => {
                    config.options.insert(key.to_string(), value.to_string());
                }
                None => config.endpoints.push(normalize_endpoint(token)),
            }
        }

        if config.endpoints.is_empty() {
            return Err(Error::InvalidArgument(
                "configuration names no endpoints".to_string(),
            ));
        }
        Ok(config)
    }
}

fn normalize_endpoint(token: &str) -> String {
    if token.contains(':') {
        token.to_string()
    } else {
        format!("{token}:{DEFAULT_PORT}")
    }
}

/// Picks the address to connect to. Direct configurations return their first
/// endpoint untouched; configurations naming a service go through sentinel
/// discovery. `None` means no server is available — that is an answer, not
/// an error.
///
/// Every step is written to `log` so callers can surface how the decision
/// was made.
pub async fn select_configuration<W: fmt::Write>(config: &Config, log: &mut W) -> Option<String> {
    match &config.service_name {
        Some(service_name) => select_master(&config.endpoints, service_name, log).await,
        None => {
            let endpoint = config.endpoints.first()?.clone();
            let _ = writeln!(log, "using direct endpoint {endpoint}");
            debug!(%endpoint, "using direct endpoint");
            Some(endpoint)
        }
    }
}

/// Asks each sentinel in order for the current master of `service_name`.
/// The first affirmative answer wins; negative answers (unknown service) and
/// unreachable sentinels fall through to the next endpoint.
pub async fn select_master<W: fmt::Write>(
    endpoints: &[String],
    service_name: &str,
    log: &mut W,
) -> Option<String> {
    for endpoint in endpoints {
        let _ = writeln!(log, "querying sentinel {endpoint} for master of {service_name}");
        debug!(%endpoint, %service_name, "querying sentinel");

        match query_sentinel(endpoint, service_name).await {
            Ok(Some(master)) => {
                let _ = writeln!(log, "sentinel {endpoint} reported master {master}");
                debug!(%endpoint, %master, "sentinel reported master");
                return Some(master);
            }
            Ok(None) => {
                let _ = writeln!(
                    log,
                    "sentinel {endpoint} does not know a master for {service_name}"
                );
                debug!(%endpoint, %service_name, "sentinel does not know service");
            }
            Err(err) => {
                let _ = writeln!(log, "sentinel {endpoint} unavailable; {err}");
                debug!(%endpoint, %err, "sentinel unavailable");
            }
        }
    }

    let _ = writeln!(log, "no master found for {service_name}; no server available");
    debug!(%service_name, "no master found");
    None
}

/// One short-lived probe. It shares nothing with any live connection: no
/// queue, no counters, its own socket.
async fn query_sentinel(endpoint: &str, service_name: &str) -> Result<Option<String>, Error> {
    let stream = timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| Error::Timeout)??;
    let (read_half, mut write_half) = stream.into_split();

    let query = Command::new("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(service_name);
    write_half.write_all(&frame::encode_command(&query)).await?;

    let mut frames = FramedRead::new(read_half, FrameCodec);
    let reply = timeout(PROBE_TIMEOUT, frames.next())
        .await
        .map_err(|_| Error::Timeout)?;

    match reply {
        Some(Ok(Frame::Array(items))) => parse_master_address(&items).map(Some),
        // A null reply or an error reply is "I do not know this service".
        Some(Ok(Frame::Null)) | Some(Ok(Frame::Error(_))) => Ok(None),
        Some(Ok(other)) => Err(Error::Protocol(format!(
            "unexpected sentinel reply: {other}"
        ))),
        Some(Err(err)) => Err(err),
        None => Err(Error::Transport(
            "sentinel closed the connection".to_string(),
        )),
    }
}

fn parse_master_address(items: &[Frame]) -> Result<String, Error> {
    let text = |frame: &Frame| -> Option<String> {
        match frame {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
            _ => None,
        }
    };

    match items {
        [host, port] => match (text(host), text(port)) {
            (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
            _ => Err(Error::Protocol(
                "sentinel reported a malformed master address".to_string(),
            )),
        },
        _ => Err(Error::Protocol(
            "sentinel reported a malformed master address".to_string(),
        )),
    }
}
