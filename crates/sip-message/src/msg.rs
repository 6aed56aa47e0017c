use crate::header::Name;
use crate::{Error, Headers, Method, Uri};
use bytes::Bytes;
use std::fmt;

/// A parsed SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    /// Opaque to this layer (SDP negotiation lives above it); `Bytes`
    /// gives callers cheap clones when the same body is retransmitted or
    /// cached as the dialog's local SDP.
    pub body: Bytes,
}

/// A parsed SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// `true` for 1xx responses (RFC 3261 §7.2).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// `true` for 2xx final responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Either side of the request/response pair, as handed between the
/// transport and transaction layers.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(resp) => &resp.headers,
        }
    }

    pub fn method(&self) -> Result<Method, Error> {
        match self {
            Message::Request(req) => Ok(req.method.clone()),
            Message::Response(resp) => Ok(resp
                .headers
                .cseq()?
                .ok_or(Error::MissingHeader("CSeq"))?
                .method),
        }
    }

    /// Parse a complete SIP message off the wire (start line, headers, CRLF,
    /// body). `Content-Length` governs the body length if present; otherwise
    /// everything past the blank line is taken as the body.
    pub fn parse(bytes: &[u8]) -> Result<Message, Error> {
        let text = std::str::from_utf8(bytes).map_err(|_| Error::Malformed {
            what: "message",
            reason: "not valid utf-8".into(),
        })?;

        let header_end = text.find("\r\n\r\n").map(|i| i + 4).unwrap_or(text.len());
        let (head, rest) = text.split_at(header_end);

        let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
        let start_line = lines.next().ok_or_else(|| Error::Malformed {
            what: "message",
            reason: "empty message".into(),
        })?;

        let mut headers = Headers::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| Error::Malformed {
                what: "header",
                reason: format!("no colon in {line:?}"),
            })?;
            headers.push(Name::parse(name.trim()), value.trim());
        }

        let body_len = headers.content_length()?.unwrap_or(rest.len() as u32) as usize;
        let body = Bytes::copy_from_slice(rest.as_bytes().get(..body_len).unwrap_or(rest.as_bytes()));

        if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
            let (status, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = status.parse().map_err(|_| Error::Malformed {
                what: "status-line",
                reason: "invalid status code".into(),
            })?;

            return Ok(Message::Response(Response {
                status,
                reason: reason.to_owned(),
                headers,
                body,
            }));
        }

        let mut parts = start_line.splitn(3, ' ');
        let method = parts.next().ok_or_else(|| Error::Malformed {
            what: "request-line",
            reason: "empty".into(),
        })?;
        let uri = parts.next().ok_or_else(|| Error::Malformed {
            what: "request-line",
            reason: "missing request-uri".into(),
        })?;

        Ok(Message::Request(Request {
            method: method.parse().unwrap(),
            uri: uri.parse()?,
            headers,
            body,
        }))
    }
}

impl Request {
    fn write_with_mode(&self, f: &mut fmt::Formatter<'_>, compact: bool) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        self.headers.write_with_mode(f, compact)?;
        if self.headers.content_length().ok().flatten().is_none() {
            let l = if compact { "l" } else { "Content-Length" };
            write!(f, "{l}: {}\r\n", self.body.len())?;
        }
        write!(f, "\r\n")?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }

    /// Serializes with compact header forms. Parsing always accepts
    /// either form regardless of which one was sent.
    pub fn to_string_compact(&self) -> String {
        struct Compact<'a>(&'a Request);
        impl fmt::Display for Compact<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.write_with_mode(f, true)
            }
        }
        Compact(self).to_string()
    }
}

impl Response {
    fn write_with_mode(&self, f: &mut fmt::Formatter<'_>, compact: bool) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status, self.reason)?;
        self.headers.write_with_mode(f, compact)?;
        if self.headers.content_length().ok().flatten().is_none() {
            let l = if compact { "l" } else { "Content-Length" };
            write!(f, "{l}: {}\r\n", self.body.len())?;
        }
        write!(f, "\r\n")?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }

    /// Serializes with compact header forms.
    pub fn to_string_compact(&self) -> String {
        struct Compact<'a>(&'a Response);
        impl fmt::Display for Compact<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.write_with_mode(f, true)
            }
        }
        Compact(self).to_string()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with_mode(f, false)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with_mode(f, false)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(req) => req.fmt(f),
            Message::Response(resp) => resp.fmt(f),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_invite_request() {
        let raw = "INVITE sip:bob@example.com SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK776asdhds\r\n\
                   Max-Forwards: 70\r\n\
                   To: Bob <sip:bob@example.com>\r\n\
                   From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                   Call-ID: a84b4c76e66710@192.0.2.1\r\n\
                   CSeq: 314159 INVITE\r\n\
                   Content-Length: 0\r\n\r\n";

        let msg = Message::parse(raw.as_bytes()).unwrap();
        match msg {
            Message::Request(req) => {
                assert_eq!(req.method, Method::Invite);
                assert_eq!(req.uri.host, "example.com");
                assert_eq!(req.headers.cseq().unwrap().unwrap().number, 314159);
                assert_eq!(req.headers.max_forwards().unwrap(), Some(70));
            }
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn parses_status_line_response() {
        let raw = "SIP/2.0 180 Ringing\r\nCSeq: 1 INVITE\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n";
        let msg = Message::parse(raw.as_bytes()).unwrap();
        match msg {
            Message::Response(resp) => {
                assert_eq!(resp.status, 180);
                assert!(resp.is_provisional());
            }
            Message::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn compact_serialization_parses_back_to_the_same_headers() {
        let mut headers = Headers::new();
        headers.push(Name::Via, "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKabc");
        headers.push(Name::CallId, "abc@host");
        headers.push(Name::CSeq, "1 INVITE");
        headers.push(Name::Contact, "<sip:alice@192.0.2.1>");

        let req = Request {
            method: Method::Invite,
            uri: Uri::sip("example.com").with_user("bob"),
            headers,
            body: Bytes::new(),
        };

        let compact = req.to_string_compact();
        assert!(compact.contains("v: SIP/2.0/UDP"));
        assert!(compact.contains("i: abc@host"));
        assert!(compact.contains("m: <sip:alice@192.0.2.1>"));
        assert!(compact.contains("l: 0"));

        let parsed = Message::parse(compact.as_bytes()).unwrap();
        match parsed {
            Message::Request(parsed) => {
                assert_eq!(parsed.headers.call_id().unwrap().unwrap().0, "abc@host");
                assert_eq!(parsed.headers.cseq().unwrap().unwrap().number, 1);
            }
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let req = Request {
            method: Method::Bye,
            uri: Uri::sip("example.com"),
            headers: {
                let mut h = Headers::new();
                h.push(Name::CallId, "abc@host");
                h.push(Name::CSeq, "2 BYE");
                h
            },
            body: Bytes::new(),
        };

        let printed = req.to_string();
        let parsed = Message::parse(printed.as_bytes()).unwrap();
        assert!(matches!(parsed, Message::Request(_)));
    }
}
