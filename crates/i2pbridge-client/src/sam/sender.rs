//! SAM command serializer

use std::fmt::Write as _;

use bytes::Bytes;
use i2pbridge_protocol::sam::quote_value;
use i2pbridge_protocol::SamVersion;

/// Session style requested from the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStyle {
    /// Stream-based connections (TCP-like)
    #[default]
    Stream,
    /// Datagram-based (UDP-like)
    Datagram,
    /// Raw data forwarding
    Raw,
}

impl SessionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStyle::Stream => "STREAM",
            SessionStyle::Datagram => "DATAGRAM",
            SessionStyle::Raw => "RAW",
        }
    }
}

/// Arguments of `SESSION CREATE`
#[derive(Debug, Clone, Copy)]
pub struct SessionCreate<'a> {
    pub style: SessionStyle,
    pub id: &'a str,

    /// Private key blob, `TRANSIENT` when absent
    pub private_key: Option<&'a str>,
    pub signature_type: Option<&'a str>,
    pub from_port: Option<u16>,
    pub options: &'a [(String, String)],
}

/// Queues one SAM command line per call
#[derive(Debug, Default)]
pub struct SamSender {
    out: String,
}

impl SamSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn end(&mut self) {
        self.out.push('\n');
    }

    pub fn hello(&mut self, min: &SamVersion, max: &SamVersion) {
        let _ = write!(self.out, "HELLO VERSION MIN={} MAX={}", min, max);
        self.end();
    }

    pub fn session_create(&mut self, args: SessionCreate<'_>) {
        let _ = write!(
            self.out,
            "SESSION CREATE STYLE={} ID={} DESTINATION={}",
            args.style.as_str(),
            args.id,
            args.private_key.unwrap_or("TRANSIENT")
        );
        if let Some(signature_type) = args.signature_type {
            let _ = write!(self.out, " SIGNATURE_TYPE={}", signature_type);
        }
        if let Some(port) = args.from_port {
            let _ = write!(self.out, " FROM_PORT={}", port);
        }
        for (key, value) in args.options {
            let _ = write!(self.out, " {}={}", key, quote_value(value));
        }
        self.end();
    }

    pub fn stream_connect(
        &mut self,
        id: &str,
        destination: &str,
        to_port: Option<u16>,
        from_port: Option<u16>,
    ) {
        let _ = write!(self.out, "STREAM CONNECT ID={} DESTINATION={} SILENT=false", id, destination);
        if let Some(port) = to_port {
            let _ = write!(self.out, " TO_PORT={}", port);
        }
        if let Some(port) = from_port {
            let _ = write!(self.out, " FROM_PORT={}", port);
        }
        self.end();
    }

    pub fn stream_accept(&mut self, id: &str) {
        let _ = write!(self.out, "STREAM ACCEPT ID={} SILENT=false", id);
        self.end();
    }

    pub fn stream_forward(&mut self, id: &str, port: u16, host: Option<&str>) {
        let _ = write!(self.out, "STREAM FORWARD ID={} PORT={}", id, port);
        if let Some(host) = host {
            let _ = write!(self.out, " HOST={}", host);
        }
        self.out.push_str(" SILENT=false");
        self.end();
    }

    pub fn naming_lookup(&mut self, name: &str) {
        let _ = write!(self.out, "NAMING LOOKUP NAME={}", name);
        self.end();
    }

    pub fn dest_generate(&mut self, signature_type: Option<&str>) {
        self.out.push_str("DEST GENERATE");
        if let Some(signature_type) = signature_type {
            let _ = write!(self.out, " SIGNATURE_TYPE={}", signature_type);
        }
        self.end();
    }

    pub fn ping(&mut self, token: Option<&str>) {
        self.keepalive("PING", token);
    }

    pub fn pong(&mut self, token: Option<&str>) {
        self.keepalive("PONG", token);
    }

    fn keepalive(&mut self, keyword: &str, token: Option<&str>) {
        self.out.push_str(keyword);
        if let Some(token) = token {
            self.out.push(' ');
            self.out.push_str(token);
        }
        self.end();
    }

    /// Drain everything queued so far
    pub fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(sender: &mut SamSender) -> String {
        String::from_utf8(sender.take().to_vec()).unwrap()
    }

    #[test]
    fn test_hello() {
        let mut sender = SamSender::new();
        sender.hello(&SamVersion::new(3, 0), &SamVersion::new(3, 3));
        assert_eq!(sent(&mut sender), "HELLO VERSION MIN=3.0 MAX=3.3\n");
        assert_eq!(sent(&mut sender), "");
    }

    #[test]
    fn test_session_create() {
        let mut sender = SamSender::new();
        sender.session_create(SessionCreate {
            style: SessionStyle::Stream,
            id: "spam",
            private_key: None,
            signature_type: Some("EdDSA_SHA512_Ed25519"),
            from_port: None,
            options: &[],
        });
        assert_eq!(
            sent(&mut sender),
            "SESSION CREATE STYLE=STREAM ID=spam DESTINATION=TRANSIENT SIGNATURE_TYPE=EdDSA_SHA512_Ed25519\n"
        );

        let options = vec![
            ("inbound.length".to_string(), "1".to_string()),
            ("outbound.nickname".to_string(), "my app".to_string()),
        ];
        sender.session_create(SessionCreate {
            style: SessionStyle::Stream,
            id: "eggs",
            private_key: Some("privkey~"),
            signature_type: None,
            from_port: Some(34444),
            options: &options,
        });
        assert_eq!(
            sent(&mut sender),
            "SESSION CREATE STYLE=STREAM ID=eggs DESTINATION=privkey~ FROM_PORT=34444 inbound.length=1 outbound.nickname=\"my app\"\n"
        );
    }

    #[test]
    fn test_stream_commands() {
        let mut sender = SamSender::new();
        sender.stream_connect("spam", "dest~", None, None);
        sender.stream_connect("spam", "dest~", Some(80), Some(34444));
        sender.stream_accept("spam");
        sender.stream_forward("spam", 1337, None);
        sender.stream_forward("spam", 1337, Some("10.0.0.1"));

        assert_eq!(
            sent(&mut sender),
            "STREAM CONNECT ID=spam DESTINATION=dest~ SILENT=false\n\
             STREAM CONNECT ID=spam DESTINATION=dest~ SILENT=false TO_PORT=80 FROM_PORT=34444\n\
             STREAM ACCEPT ID=spam SILENT=false\n\
             STREAM FORWARD ID=spam PORT=1337 SILENT=false\n\
             STREAM FORWARD ID=spam PORT=1337 HOST=10.0.0.1 SILENT=false\n"
        );
    }

    #[test]
    fn test_naming_dest_and_keepalive() {
        let mut sender = SamSender::new();
        sender.naming_lookup("ME");
        sender.dest_generate(None);
        sender.dest_generate(Some("DSA_SHA1"));
        sender.ping(Some("1234"));
        sender.pong(None);

        assert_eq!(
            sent(&mut sender),
            "NAMING LOOKUP NAME=ME\nDEST GENERATE\nDEST GENERATE SIGNATURE_TYPE=DSA_SHA1\nPING 1234\nPONG\n"
        );
    }
}
