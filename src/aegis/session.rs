use crate::aegis::codec::{self, DecodeError, Frame};

/// Protocol lifecycle stage of a connection. Transitions only move forward;
/// the only exit from `Play` is connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Login,
    Play,
}

/// Something the inspector extracted from a client frame. Frames that match
/// no `(phase, id)` rule produce no event and are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketEvent {
    Handshake {
        protocol_version: i32,
        server_addr: String,
        port: u16,
        next_state: i32,
    },
    LoginStart {
        username: String,
    },
    Chat {
        message: String,
    },
}

/// Per-connection protocol state, owned exclusively by the connection's
/// client-to-backend relay task.
#[derive(Debug)]
pub struct Session {
    client_ip: String,
    phase: Phase,
    username: Option<String>,
}

impl Session {
    pub fn new(client_ip: String) -> Self {
        Self {
            client_ip,
            phase: Phase::Handshake,
            username: None,
        }
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Inspect one decoded frame, advance the state machine, and surface any
    /// extracted field of interest.
    ///
    /// Malformed field lengths are a hard error; the connection is torn down
    /// rather than forwarding a frame we could not account for.
    pub fn inspect(&mut self, frame: &Frame) -> Result<Option<PacketEvent>, DecodeError> {
        let body = frame.body();
        let (packet_id, id_n) = bounded_varint(body)?;
        let payload = &body[id_n..];

        match (self.phase, packet_id) {
            (Phase::Handshake, 0x00) => {
                let ev = parse_handshake(payload)?;
                if let PacketEvent::Handshake { next_state, .. } = ev {
                    // next_state 2 is login; 1 is a status ping which keeps
                    // the phase and is forwarded as-is.
                    if next_state == 2 {
                        self.phase = Phase::Login;
                    }
                }
                Ok(Some(ev))
            }
            (Phase::Login, 0x00) => {
                let (username, _) = parse_string(payload)?;
                if self.username.is_none() {
                    self.username = Some(username.clone());
                }
                self.phase = Phase::Play;
                Ok(Some(PacketEvent::LoginStart { username }))
            }
            (Phase::Play, 0x07) => {
                if payload.is_empty() {
                    return Err(DecodeError::MalformedPacket("empty chat payload".into()));
                }
                // First byte is a position/marker; the rest is the message.
                let message = String::from_utf8_lossy(&payload[1..]).into_owned();
                Ok(Some(PacketEvent::Chat { message }))
            }
            _ => Ok(None),
        }
    }
}

fn parse_handshake(payload: &[u8]) -> Result<PacketEvent, DecodeError> {
    let mut i = 0usize;

    let (protocol_version, n) = bounded_varint(&payload[i..])?;
    i += n;

    let (server_addr, n) = parse_string(&payload[i..])?;
    i += n;

    if payload.len() < i + 2 {
        return Err(DecodeError::MalformedPacket(
            "handshake truncated before port".into(),
        ));
    }
    let port = u16::from_be_bytes([payload[i], payload[i + 1]]);
    i += 2;

    let (next_state, _) = bounded_varint(&payload[i..])?;

    Ok(PacketEvent::Handshake {
        protocol_version,
        server_addr,
        port,
        next_state,
    })
}

/// Length-prefixed UTF-8 string. Returns the string and total bytes consumed.
fn parse_string(buf: &[u8]) -> Result<(String, usize), DecodeError> {
    let (len, len_n) = bounded_varint(buf)?;
    if len < 0 {
        return Err(DecodeError::MalformedPacket(format!(
            "negative string length {len}"
        )));
    }
    let len = len as usize;
    if buf.len() < len_n + len {
        return Err(DecodeError::MalformedPacket(format!(
            "string length {len} exceeds remaining payload {}",
            buf.len() - len_n
        )));
    }
    let s = String::from_utf8_lossy(&buf[len_n..len_n + len]).into_owned();
    Ok((s, len_n + len))
}

/// Varint inside a bounded payload: running out of bytes here means the frame
/// lied about its contents, not that more data is coming.
fn bounded_varint(buf: &[u8]) -> Result<(i32, usize), DecodeError> {
    match codec::read_varint(buf) {
        Ok(v) => Ok(v),
        Err(DecodeError::NeedMoreData) => Err(DecodeError::MalformedPacket(
            "truncated varint field".into(),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aegis::codec::write_varint;

    fn varint(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(v, &mut out);
        out
    }

    fn mc_string(s: &str) -> Vec<u8> {
        let mut out = varint(s.len() as i32);
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn frame(body: Vec<u8>) -> Frame {
        let mut raw = varint(body.len() as i32);
        let body_offset = raw.len();
        raw.extend_from_slice(&body);
        Frame::from_parts(raw, body_offset)
    }

    fn handshake_frame(host: &str, port: u16, proto_ver: i32, next_state: i32) -> Frame {
        let mut body = varint(0x00);
        body.extend(varint(proto_ver));
        body.extend(mc_string(host));
        body.extend_from_slice(&port.to_be_bytes());
        body.extend(varint(next_state));
        frame(body)
    }

    fn login_start_frame(username: &str) -> Frame {
        let mut body = varint(0x00);
        body.extend(mc_string(username));
        frame(body)
    }

    fn chat_frame(message: &str) -> Frame {
        let mut body = varint(0x07);
        body.push(0x00); // marker byte
        body.extend_from_slice(message.as_bytes());
        frame(body)
    }

    #[test]
    fn handshake_login_play_transition_records_username() {
        let mut s = Session::new("10.0.0.1".into());
        assert_eq!(s.phase(), Phase::Handshake);

        let ev = s
            .inspect(&handshake_frame("mc.example.com", 25565, 763, 2))
            .expect("inspect")
            .expect("event");
        assert_eq!(
            ev,
            PacketEvent::Handshake {
                protocol_version: 763,
                server_addr: "mc.example.com".into(),
                port: 25565,
                next_state: 2,
            }
        );
        assert_eq!(s.phase(), Phase::Login);

        let ev = s
            .inspect(&login_start_frame("Steve"))
            .expect("inspect")
            .expect("event");
        assert_eq!(
            ev,
            PacketEvent::LoginStart {
                username: "Steve".into()
            }
        );
        assert_eq!(s.phase(), Phase::Play);
        assert_eq!(s.username(), Some("Steve"));
    }

    #[test]
    fn status_ping_leaves_phase_unchanged() {
        let mut s = Session::new("10.0.0.1".into());
        s.inspect(&handshake_frame("mc.example.com", 25565, 763, 1))
            .expect("inspect");
        assert_eq!(s.phase(), Phase::Handshake);
        assert_eq!(s.username(), None);
    }

    #[test]
    fn chat_is_surfaced_without_state_change() {
        let mut s = Session::new("10.0.0.1".into());
        s.inspect(&handshake_frame("mc.example.com", 25565, 763, 2))
            .expect("inspect");
        s.inspect(&login_start_frame("Steve")).expect("inspect");

        let ev = s
            .inspect(&chat_frame("hello world"))
            .expect("inspect")
            .expect("event");
        assert_eq!(
            ev,
            PacketEvent::Chat {
                message: "hello world".into()
            }
        );
        assert_eq!(s.phase(), Phase::Play);
    }

    #[test]
    fn unknown_packet_is_ignored() {
        let mut s = Session::new("10.0.0.1".into());
        let mut body = varint(0x42);
        body.extend_from_slice(b"whatever");
        assert!(s.inspect(&frame(body)).expect("inspect").is_none());
        assert_eq!(s.phase(), Phase::Handshake);
    }

    #[test]
    fn overlong_string_length_is_malformed() {
        let mut s = Session::new("10.0.0.1".into());
        // Login-start claiming a 200-byte username with 5 bytes present.
        s.inspect(&handshake_frame("mc.example.com", 25565, 763, 2))
            .expect("inspect");
        let mut body = varint(0x00);
        body.extend(varint(200));
        body.extend_from_slice(b"Steve");
        let err = s.inspect(&frame(body)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPacket(_)));
    }

    #[test]
    fn truncated_handshake_is_malformed() {
        let mut s = Session::new("10.0.0.1".into());
        let mut body = varint(0x00);
        body.extend(varint(763));
        body.extend(mc_string("mc.example.com"));
        // Port and next_state missing.
        let err = s.inspect(&frame(body)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPacket(_)));
    }
}
