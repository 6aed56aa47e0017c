//! Configuration surface. A typed container, not a loader: reading from
//! environment/files/CLI flags is the embedding application's job.

/// Recognized configuration options. `sip_port` defaults to `5060`, and
/// `sip_address`/`my_address` fall back to the first resolved address of
/// the local hostname, then `127.0.0.1`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the transport layer.
    pub sip_address: String,
    pub sip_port: u16,
    /// Advertised in `Via`/`Contact` when it differs from `sip_address`
    /// (e.g. behind NAT); `None` means "advertise the bind address".
    pub my_address: Option<String>,
    pub my_port: Option<u16>,
    pub ipv6_enabled: bool,
    /// Emitted as `User-Agent` (UAC) / `Server` (UAS).
    pub my_uaname: String,
    /// SDP payload type numbers exposed in `Allow`/SDP negotiation, in
    /// preference order. Empty means "no restriction advertised".
    pub allow_formats: Vec<u32>,
}

impl Config {
    /// Resolves the local hostname's first address, falling back to
    /// `127.0.0.1` if resolution fails or returns nothing.
    pub fn discover() -> Self {
        let address = resolve_local_address().unwrap_or_else(|| "127.0.0.1".to_owned());

        Config {
            sip_address: address,
            sip_port: 5060,
            my_address: None,
            my_port: None,
            ipv6_enabled: false,
            my_uaname: "Sippy".to_owned(),
            allow_formats: Vec::new(),
        }
    }

    /// The address advertised in `Via`/`Contact`: `my_address` if set,
    /// otherwise the bind address.
    pub fn advertised_address(&self) -> &str {
        self.my_address.as_deref().unwrap_or(&self.sip_address)
    }

    pub fn advertised_port(&self) -> u16 {
        self.my_port.unwrap_or(self.sip_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sip_address: "127.0.0.1".to_owned(),
            sip_port: 5060,
            my_address: None,
            my_port: None,
            ipv6_enabled: false,
            my_uaname: "Sippy".to_owned(),
            allow_formats: Vec::new(),
        }
    }
}

fn resolve_local_address() -> Option<String> {
    use std::net::ToSocketAddrs;

    let hostname = hostname()?;
    (hostname.as_str(), 0u16)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip().to_string())
}

fn hostname() -> Option<String> {
    // `std` has no portable hostname lookup; shelling out to `hostname(1)`
    // matches what an embedding application would otherwise do, and keeps
    // this crate free of a platform-specific dependency for one lookup
    // that only ever feeds a `Config` default.
    let output = std::process::Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8(output.stdout).ok()?;
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}
