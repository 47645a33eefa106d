//! Textual endpoint descriptors, in the `tcp:addr=..,port=..` / `unix:path=..` form used on the
//! command line and passed to the bridging helper, and in swtpm's own `type=tcp,port=..` form.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    str::FromStr,
};

use thiserror::Error;

/// The address a `tcp:` endpoint uses when none is specified.
pub const DEFAULT_TCP_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// The port a `tcp:` endpoint uses when none is specified. Binding to it picks an ephemeral port.
pub const DEFAULT_TCP_PORT: u16 = 0;

const PREFIX_TCP: &str = "tcp:";
const PREFIX_UNIX: &str = "unix:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Unknown endpoint kind in \"{0}\", expected tcp: or unix:")]
    UnknownPrefix(String),

    #[error("Unknown swtpm socket type \"{0}\", expected tcp or unixio")]
    UnknownType(String),

    #[error("Missing path in unix endpoint \"{0}\"")]
    MissingPath(String),

    #[error("Invalid port \"{1}\" in endpoint \"{0}\"")]
    InvalidPort(String, String),

    #[error("Invalid IP address \"{1}\" in endpoint \"{0}\"")]
    InvalidAddress(String, String),

    #[error("Invalid octal mode \"{1}\" in endpoint \"{0}\"")]
    InvalidMode(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Unix,
}

/// One physical transport location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketEndpoint {
    pub kind: SocketKind,

    /// The IP address for `tcp`, or the filesystem path for `unix`.
    pub address: String,

    /// Only meaningful for `tcp`, where it is always present.
    pub port: Option<u16>,

    /// The permissions to give a unix socket file after binding it.
    pub mode: Option<u32>,
}

impl SocketEndpoint {
    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self {
            kind: SocketKind::Tcp,
            address: address.to_string(),
            port: Some(port),
            mode: None,
        }
    }

    pub fn unix<P: AsRef<Path>>(path: P) -> Self {
        Self {
            kind: SocketKind::Unix,
            address: path.as_ref().to_string_lossy().into_owned(),
            port: None,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// The socket address of a `tcp` endpoint, or `None` for `unix` endpoints.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            SocketKind::Tcp => {
                let ip = self.address.parse::<IpAddr>().ok()?;
                Some(SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_TCP_PORT)))
            }
            SocketKind::Unix => None,
        }
    }

    /// Parses an endpoint in the `tcp:addr=<ip>,port=<n>` or `unix:path=<path>[,mode=<octal>]`
    /// form. Unknown keys are ignored.
    pub fn parse_prefixed(input: &str) -> Result<Self, AddressError> {
        if let Some(options) = input.strip_prefix(PREFIX_TCP) {
            let mut address = DEFAULT_TCP_ADDR;
            let mut port = DEFAULT_TCP_PORT;
            for (key, value) in key_values(options) {
                match key {
                    "addr" => address = parse_ip(input, value)?,
                    "port" => port = parse_port(input, value)?,
                    _ => {}
                }
            }

            Ok(Self::tcp(address, port))
        } else if let Some(options) = input.strip_prefix(PREFIX_UNIX) {
            let mut path = None;
            let mut mode = None;
            for (key, value) in key_values(options) {
                match key {
                    "path" if !value.is_empty() => path = Some(value),
                    "mode" => mode = Some(parse_mode(input, value)?),
                    _ => {}
                }
            }

            let path = path.ok_or_else(|| AddressError::MissingPath(input.to_string()))?;
            let mut endpoint = Self::unix(path);
            endpoint.mode = mode;
            Ok(endpoint)
        } else {
            Err(AddressError::UnknownPrefix(input.to_string()))
        }
    }

    /// Parses an endpoint in swtpm's own option syntax, as given to its `--ctrl` and `--server`
    /// arguments: `type=tcp[,addr=<ip>][,port=<n>]` or `type=unixio,path=<path>`.
    pub fn parse_swtpm(input: &str) -> Result<Self, AddressError> {
        let mut kind = None;
        let mut address = None;
        let mut port = DEFAULT_TCP_PORT;
        let mut mode = None;

        for (key, value) in key_values(input) {
            match key {
                "type" => {
                    kind = match value {
                        "tcp" => Some(SocketKind::Tcp),
                        "unixio" => Some(SocketKind::Unix),
                        other => return Err(AddressError::UnknownType(other.to_string())),
                    }
                }
                "addr" | "path" => address = Some(value),
                "port" => port = parse_port(input, value)?,
                "mode" => mode = Some(parse_mode(input, value)?),
                _ => {}
            }
        }

        match kind {
            Some(SocketKind::Tcp) => {
                let address = match address {
                    Some(value) => parse_ip(input, value)?,
                    None => DEFAULT_TCP_ADDR,
                };

                Ok(Self::tcp(address, port))
            }
            Some(SocketKind::Unix) => {
                let path = address
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| AddressError::MissingPath(input.to_string()))?;
                let mut endpoint = Self::unix(path);
                endpoint.mode = mode;
                Ok(endpoint)
            }
            None => Err(AddressError::UnknownPrefix(input.to_string())),
        }
    }
}

impl Default for SocketEndpoint {
    /// An ephemeral TCP port on localhost.
    fn default() -> Self {
        Self::tcp(DEFAULT_TCP_ADDR, DEFAULT_TCP_PORT)
    }
}

impl FromStr for SocketEndpoint {
    type Err = AddressError;

    /// Accepts both the prefixed form and swtpm's `type=` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(PREFIX_TCP) || s.starts_with(PREFIX_UNIX) {
            Self::parse_prefixed(s)
        } else if key_values(s).any(|(key, _)| key == "type") {
            Self::parse_swtpm(s)
        } else {
            Err(AddressError::UnknownPrefix(s.to_string()))
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SocketKind::Tcp => write!(
                f,
                "{PREFIX_TCP}addr={},port={}",
                self.address,
                self.port.unwrap_or(DEFAULT_TCP_PORT)
            ),
            SocketKind::Unix => {
                write!(f, "{PREFIX_UNIX}path={}", self.address)?;
                match self.mode {
                    Some(mode) => write!(f, ",mode={mode:o}"),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Splits `a=1,b=2,c` into `("a", "1"), ("b", "2"), ("c", "")`.
fn key_values(options: &str) -> impl Iterator<Item = (&str, &str)> {
    options
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.split_once('=').unwrap_or((s, "")))
}

fn parse_ip(input: &str, value: &str) -> Result<IpAddr, AddressError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| AddressError::InvalidAddress(input.to_string(), value.to_string()))
}

fn parse_port(input: &str, value: &str) -> Result<u16, AddressError> {
    value
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(input.to_string(), value.to_string()))
}

fn parse_mode(input: &str, value: &str) -> Result<u32, AddressError> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| AddressError::InvalidMode(input.to_string(), value.to_string()))
}
