use crate::Error;
use std::fmt;
use std::str::FromStr;

/// A `sip:`/`sips:` request URI or address-of-record URI.
///
/// Parsing here is deliberately simple: it splits on the punctuation the
/// grammar actually uses instead of implementing the full RFC 3261 ABNF.
/// This type only needs to round-trip the fields the transaction and
/// dialog layers inspect (user, host, port, transport param).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, String)>,
}

impl Uri {
    pub fn sip(host: impl Into<String>) -> Self {
        Uri {
            secure: false,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", if self.secure { "sips" } else { "sip" })?;

        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        for (name, value) in &self.params {
            if value.is_empty() {
                write!(f, ";{}", name)?;
            } else {
                write!(f, ";{}={}", name, value)?;
            }
        }

        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (scheme, rest) = s.split_once(':').ok_or_else(|| Error::Malformed {
            what: "uri",
            reason: "missing scheme".into(),
        })?;

        let secure = match scheme {
            "sip" => false,
            "sips" => true,
            other => {
                return Err(Error::Malformed {
                    what: "uri",
                    reason: format!("unsupported scheme {other}"),
                })
            }
        };

        let mut parts = rest.split(';');
        let userhost = parts.next().unwrap_or_default();

        let params = parts
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_owned(), v.to_owned()),
                None => (p.to_owned(), String::new()),
            })
            .collect();

        let (user, hostport) = match userhost.split_once('@') {
            Some((user, hostport)) => (Some(user.to_owned()), hostport),
            None => (None, userhost),
        };

        let (host, port) = match hostport.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| Error::Malformed {
                    what: "uri",
                    reason: "invalid port".into(),
                })?;
                (host.to_owned(), Some(port))
            }
            None => (hostport.to_owned(), None),
        };

        if host.is_empty() {
            return Err(Error::Malformed {
                what: "uri",
                reason: "missing host".into(),
            });
        }

        Ok(Uri {
            secure,
            user,
            host,
            port,
            params,
        })
    }
}
