//! BOB command serializer

use bytes::{BufMut, Bytes, BytesMut};

/// Queues one BOB command line per call
#[derive(Debug, Default)]
pub struct BobSender {
    out: BytesMut,
}

impl BobSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&mut self, command: &str, argument: Option<&str>) {
        self.out.put_slice(command.as_bytes());
        if let Some(argument) = argument {
            self.out.put_u8(b' ');
            self.out.put_slice(argument.as_bytes());
        }
        self.out.put_u8(b'\n');
    }

    pub fn clear(&mut self) {
        self.line("clear", None);
    }

    pub fn getdest(&mut self) {
        self.line("getdest", None);
    }

    pub fn getkeys(&mut self) {
        self.line("getkeys", None);
    }

    pub fn getnick(&mut self, nickname: &str) {
        self.line("getnick", Some(nickname));
    }

    pub fn inhost(&mut self, host: &str) {
        self.line("inhost", Some(host));
    }

    pub fn inport(&mut self, port: u16) {
        self.line("inport", Some(&port.to_string()));
    }

    pub fn list(&mut self) {
        self.line("list", None);
    }

    pub fn newkeys(&mut self) {
        self.line("newkeys", None);
    }

    pub fn option(&mut self) {
        self.line("option", None);
    }

    pub fn outhost(&mut self, host: &str) {
        self.line("outhost", Some(host));
    }

    pub fn outport(&mut self, port: u16) {
        self.line("outport", Some(&port.to_string()));
    }

    pub fn quiet(&mut self) {
        self.line("quiet", None);
    }

    pub fn quit(&mut self) {
        self.line("quit", None);
    }

    pub fn setkeys(&mut self, keys: &str) {
        self.line("setkeys", Some(keys));
    }

    pub fn setnick(&mut self, nickname: &str) {
        self.line("setnick", Some(nickname));
    }

    pub fn show(&mut self) {
        self.line("show", None);
    }

    pub fn showprops(&mut self) {
        self.line("showprops", None);
    }

    pub fn start(&mut self) {
        self.line("start", None);
    }

    pub fn status(&mut self, nickname: &str) {
        self.line("status", Some(nickname));
    }

    pub fn stop(&mut self) {
        self.line("stop", None);
    }

    pub fn verify(&mut self, key: &str) {
        self.line("verify", Some(key));
    }

    pub fn visit(&mut self) {
        self.line("visit", None);
    }

    /// Drain everything queued so far
    pub fn take(&mut self) -> Bytes {
        self.out.split().freeze()
    }
}
