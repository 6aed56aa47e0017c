use crate::{Error, Method, Uri};
use std::fmt;
use std::str::FromStr;

/// Generic `;name=value` parameter list attached to Via/address headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Insert or overwrite a parameter.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        if let Some(entry) = self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            entry.1 = Some(value);
        } else {
            self.0.push((name, Some(value)));
        }
    }

    fn parse(s: &str) -> Self {
        let params = s
            .split(';')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_owned(), Some(v.to_owned())),
                None => (p.to_owned(), None),
            })
            .collect();

        Params(params)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{name}={value}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

/// `host[:port]`, as used by the `sent-by` part of a Via header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) => Ok(HostPort {
                host: host.to_owned(),
                port: Some(port.parse().map_err(|_| Error::Malformed {
                    what: "hostport",
                    reason: "invalid port".into(),
                })?),
            }),
            None => Ok(HostPort {
                host: s.to_owned(),
                port: None,
            }),
        }
    }
}

/// A single `Via` header value. `sip-transaction` keys transactions on the
/// `branch` parameter of the top Via.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub sent_by: HostPort,
    pub params: Params,
}

impl Via {
    pub fn new(transport: impl Into<String>, sent_by: HostPort, branch: impl Into<String>) -> Self {
        let mut params = Params::new();
        params.set("branch", branch);

        Via {
            transport: transport.into(),
            sent_by,
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (proto, rest) = s.split_once(' ').ok_or_else(|| Error::Malformed {
            what: "Via",
            reason: "missing sent-by".into(),
        })?;

        let transport = proto
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::Malformed {
                what: "Via",
                reason: "missing SIP/2.0 protocol".into(),
            })?
            .to_owned();

        let mut parts = rest.splitn(2, ';');
        let sent_by: HostPort = parts.next().unwrap_or_default_str().parse()?;
        let params = parts.next().map(Params::parse).unwrap_or_default();

        Ok(Via {
            transport,
            sent_by,
            params,
        })
    }
}

trait OrDefaultStr {
    fn unwrap_or_default_str(self) -> String;
}

impl OrDefaultStr for Option<&str> {
    fn unwrap_or_default_str(self) -> String {
        self.unwrap_or("").trim().to_owned()
    }
}

/// Shared shape for address-bearing headers (From, To, Contact, Route,
/// Record-Route, Also): a display name plus a URI plus trailing params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressHeader {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl AddressHeader {
    pub fn new(uri: Uri) -> Self {
        AddressHeader {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.params.set("tag", tag);
    }
}

impl fmt::Display for AddressHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{name}\" <{}>{}", self.uri, self.params),
            None => write!(f, "<{}>{}", self.uri, self.params),
        }
    }
}

impl FromStr for AddressHeader {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (display_name, rest) = if let Some(lt) = s.find('<') {
            let name = s[..lt].trim().trim_matches('"');
            let name = if name.is_empty() { None } else { Some(name.to_owned()) };
            (name, &s[lt + 1..])
        } else {
            (None, s)
        };

        let (uri_part, params_part) = match rest.find('>') {
            Some(gt) => (&rest[..gt], rest.get(gt + 1..).unwrap_or("")),
            None => match rest.split_once(';') {
                Some((uri, params)) => (uri, params),
                None => (rest, ""),
            },
        };

        let uri: Uri = uri_part.trim().parse()?;
        let params = Params::parse(params_part.trim_start_matches(';'));

        Ok(AddressHeader {
            display_name,
            uri,
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallId(pub String);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CallId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CallId(s.trim().to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, method) = s.trim().split_once(' ').ok_or_else(|| Error::Malformed {
            what: "CSeq",
            reason: "missing method".into(),
        })?;

        Ok(CSeq {
            number: number.parse().map_err(|_| Error::Malformed {
                what: "CSeq",
                reason: "invalid sequence number".into(),
            })?,
            method: method.trim().parse().unwrap(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxForwards(pub u32);

impl fmt::Display for MaxForwards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expires(pub u32);

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `WWW-Authenticate` / `Proxy-Authenticate` challenge (RFC 2617 digest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Vec<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

/// `Authorization` / `Proxy-Authorization` response (RFC 2617 digest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    pub nc: Option<u32>,
    pub opaque: Option<String>,
}

impl fmt::Display for AuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"Digest realm="{}", nonce="{}""#, self.realm, self.nonce)?;
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={algorithm}")?;
        }
        if !self.qop.is_empty() {
            write!(f, r#", qop="{}""#, self.qop.join(","))?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, r#", opaque="{opaque}""#)?;
        }
        if self.stale {
            write!(f, ", stale=true")?;
        }
        Ok(())
    }
}

impl FromStr for AuthChallenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params = parse_auth_params(s, "Digest")?;

        Ok(AuthChallenge {
            realm: find_param(&params, "realm").ok_or_else(|| Error::Malformed {
                what: "WWW-Authenticate",
                reason: "missing realm".into(),
            })?,
            nonce: find_param(&params, "nonce").ok_or_else(|| Error::Malformed {
                what: "WWW-Authenticate",
                reason: "missing nonce".into(),
            })?,
            qop: find_param(&params, "qop")
                .map(|qop| qop.split(',').map(|s| s.trim().to_owned()).collect())
                .unwrap_or_default(),
            algorithm: find_param(&params, "algorithm"),
            opaque: find_param(&params, "opaque"),
            stale: find_param(&params, "stale").as_deref() == Some("true"),
        })
    }
}

impl fmt::Display for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        if let Some(algorithm) = &self.algorithm {
            write!(f, ", algorithm={algorithm}")?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop={qop}")?;
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, r#", cnonce="{cnonce}""#)?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={nc:08x}")?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, r#", opaque="{opaque}""#)?;
        }
        Ok(())
    }
}

fn parse_auth_params(s: &str, expect_scheme: &str) -> Result<Vec<(String, String)>, Error> {
    let s = s.trim();
    let rest = s.strip_prefix(expect_scheme).ok_or_else(|| Error::Malformed {
        what: "auth-header",
        reason: format!("expected {expect_scheme} scheme"),
    })?;

    Ok(rest
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (k, v) = part.split_once('=')?;
            Some((k.trim().to_owned(), v.trim().trim_matches('"').to_owned()))
        })
        .collect())
}

fn find_param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}
