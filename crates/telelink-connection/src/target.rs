//! Connection target strings.
//!
//! Accepted forms:
//!
//! - `host`, `host:port`, `[v6addr]:port`, optionally prefixed with `tcp://`
//! - `Service@host:port`: the part before `@` names the remote device
//! - `file:path` or `file://path`: replay a log instead of connecting

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use telelink_types::config::DEFAULT_PORT;
use telelink_types::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Remote {
        service: Option<String>,
        host: String,
        port: u16,
    },
    File(PathBuf),
}

impl Target {
    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr_string(&self) -> Option<String> {
        match self {
            Target::Remote { host, port, .. } if host.contains(':') => {
                Some(format!("[{host}]:{port}"))
            }
            Target::Remote { host, port, .. } => Some(format!("{host}:{port}")),
            Target::File(_) => None,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            Target::Remote { service, .. } => service.as_deref(),
            Target::File(_) => None,
        }
    }
}

impl FromStr for Target {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidTarget(s.to_string());
        let s_trim = s.trim();
        if let Some(path) = s_trim
            .strip_prefix("file://")
            .or_else(|| s_trim.strip_prefix("file:"))
        {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Target::File(PathBuf::from(path)));
        }

        let rest = s_trim.strip_prefix("tcp://").unwrap_or(s_trim);
        let (service, addr) = match rest.rsplit_once('@') {
            Some((service, addr)) if !service.is_empty() => (Some(service.to_string()), addr),
            Some(_) => return Err(invalid()),
            None => (None, rest),
        };

        let (host, port) = if let Some(v6) = addr.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match addr.rsplit_once(':') {
                Some((host, p)) => (host, p.parse().map_err(|_| invalid())?),
                None => (addr, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Target::Remote {
            service,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(path) => write!(f, "file:{}", path.display()),
            Target::Remote { service, .. } => {
                if let Some(service) = service {
                    write!(f, "{service}@")?;
                }
                f.write_str(&self.socket_addr_string().unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(service: Option<&str>, host: &str, port: u16) -> Target {
        Target::Remote {
            service: service.map(str::to_string),
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_parse_service_at_host_port() {
        let t: Target = "Tracker0@tracker-host:3900".parse().unwrap();
        assert_eq!(t, remote(Some("Tracker0"), "tracker-host", 3900));
        assert_eq!(t.service(), Some("Tracker0"));
        assert_eq!(t.to_string(), "Tracker0@tracker-host:3900");
    }

    #[test]
    fn test_default_port_and_scheme() {
        let t: Target = "tcp://localhost".parse().unwrap();
        assert_eq!(t, remote(None, "localhost", DEFAULT_PORT));
        assert_eq!(t.socket_addr_string().unwrap(), "localhost:3883");
    }

    #[test]
    fn test_ipv6_host() {
        let t: Target = "Button0@[::1]:4000".parse().unwrap();
        assert_eq!(t, remote(Some("Button0"), "::1", 4000));
        assert_eq!(t.socket_addr_string().unwrap(), "[::1]:4000");
        let t: Target = "[fe80::1]".parse().unwrap();
        assert_eq!(t, remote(None, "fe80::1", DEFAULT_PORT));
    }

    #[test]
    fn test_file_targets() {
        let t: Target = "file:///tmp/run.tlog".parse().unwrap();
        assert_eq!(t, Target::File(PathBuf::from("/tmp/run.tlog")));
        let t: Target = "file:run.tlog".parse().unwrap();
        assert_eq!(t, Target::File(PathBuf::from("run.tlog")));
        assert_eq!(t.socket_addr_string(), None);
    }

    #[test]
    fn test_invalid_targets() {
        for bad in ["", "@host", "host:notaport", "host:70000", "[::1", "file:", "Tracker0@"] {
            assert!(
                matches!(bad.parse::<Target>(), Err(TransportError::InvalidTarget(_))),
                "{bad} should be rejected"
            );
        }
    }
}
