use crate::header::name::Name;
use crate::header::typed::{AddressHeader, AuthChallenge, AuthResponse, CSeq, CallId, Via};
use crate::Error;
use std::fmt;

/// Header storage, preserving insertion order and repetition (Via/Route all
/// repeat, per RFC 3261 §7.3.1).
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(Name, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: Name, value: impl Into<String>) {
        self.0.push((name, value.into()));
    }

    pub fn get(&self, name: &Name) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a Name) -> impl Iterator<Item = &'a str> {
        self.0.iter().filter(move |(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &Name) {
        self.0.retain(|(n, _)| n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &str)> {
        self.0.iter().map(|(n, v)| (n, v.as_str()))
    }

    fn typed<T: std::str::FromStr<Err = Error>>(&self, name: Name) -> Result<Option<T>, Error> {
        self.get(&name).map(str::parse).transpose()
    }

    fn typed_all<T: std::str::FromStr<Err = Error>>(&self, name: Name) -> Result<Vec<T>, Error> {
        self.get_all(&name).map(str::parse).collect()
    }

    pub fn via(&self) -> Result<Option<Via>, Error> {
        self.typed(Name::Via)
    }

    pub fn vias(&self) -> Result<Vec<Via>, Error> {
        self.typed_all(Name::Via)
    }

    pub fn push_via(&mut self, via: &Via) {
        self.push(Name::Via, via.to_string());
    }

    pub fn from(&self) -> Result<Option<AddressHeader>, Error> {
        self.typed(Name::From)
    }

    pub fn to(&self) -> Result<Option<AddressHeader>, Error> {
        self.typed(Name::To)
    }

    pub fn contact(&self) -> Result<Option<AddressHeader>, Error> {
        self.typed(Name::Contact)
    }

    pub fn route(&self) -> Result<Vec<AddressHeader>, Error> {
        self.typed_all(Name::Route)
    }

    pub fn record_route(&self) -> Result<Vec<AddressHeader>, Error> {
        self.typed_all(Name::RecordRoute)
    }

    pub fn also(&self) -> Result<Option<AddressHeader>, Error> {
        self.typed(Name::Also)
    }

    pub fn call_id(&self) -> Result<Option<CallId>, Error> {
        self.typed(Name::CallId)
    }

    pub fn cseq(&self) -> Result<Option<CSeq>, Error> {
        self.typed(Name::CSeq)
    }

    pub fn max_forwards(&self) -> Result<Option<u32>, Error> {
        self.get(&Name::MaxForwards)
            .map(|v| {
                v.trim().parse().map_err(|_| Error::Malformed {
                    what: "Max-Forwards",
                    reason: "not a number".into(),
                })
            })
            .transpose()
    }

    pub fn expires(&self) -> Result<Option<u32>, Error> {
        self.get(&Name::Expires)
            .map(|v| {
                v.trim().parse().map_err(|_| Error::Malformed {
                    what: "Expires",
                    reason: "not a number".into(),
                })
            })
            .transpose()
    }

    pub fn content_length(&self) -> Result<Option<u32>, Error> {
        self.get(&Name::ContentLength)
            .map(|v| {
                v.trim().parse().map_err(|_| Error::Malformed {
                    what: "Content-Length",
                    reason: "not a number".into(),
                })
            })
            .transpose()
    }

    pub fn www_authenticate(&self) -> Result<Option<AuthChallenge>, Error> {
        self.typed(Name::WwwAuthenticate)
    }

    pub fn proxy_authenticate(&self) -> Result<Option<AuthChallenge>, Error> {
        self.typed(Name::ProxyAuthenticate)
    }

    pub fn authorization(&self) -> Result<Option<AuthResponse>, Error> {
        self.typed(Name::Authorization)
    }

    pub fn proxy_authorization(&self) -> Result<Option<AuthResponse>, Error> {
        self.typed(Name::ProxyAuthorization)
    }
}

impl Headers {
    /// Serializes with either the long or the compact form per header.
    /// [`fmt::Display`] always uses the long form;
    /// [`crate::Request::to_string_compact`] /
    /// [`crate::Response::to_string_compact`] go through this with
    /// `compact: true`.
    pub fn write_with_mode(&self, f: &mut fmt::Formatter<'_>, compact: bool) -> fmt::Result {
        for (name, value) in &self.0 {
            let printed = if compact { name.compact().unwrap_or_else(|| name.long()) } else { name.long() };
            writeln!(f, "{printed}: {value}\r")?;
        }
        Ok(())
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with_mode(f, false)
    }
}
