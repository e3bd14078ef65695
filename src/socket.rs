//! Transports: UDP, the TCP "obfuscated-2" relay framing, and SOCKS5
//! tunneling (spec §6 "Datagram framing", "SOCKS5 tunneling").
//! Grounded on `original_source/.../NetworkSocket.h/.cpp`.

use crate::crypto;
use crate::error::EngineResult;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

pub const MAX_TCP_MESSAGE_LEN: usize = 1500;

/// A reliable or unreliable datagram path to a relay or peer. Every
/// implementation is owned and driven by the receive/send threads
/// (spec §5); nothing here blocks the scheduler.
pub trait Transport: Send {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<()>;
    /// Blocks until a datagram arrives, or until the transport is
    /// closed (returns `Ok(None)` then).
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, addr)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One direction's AES-CTR keystream state for the obfuscated-2 TCP
/// framing (spec §6): 32-byte key plus 16-byte IV, derived from the
/// 64-byte handshake nonce each side sends on connect.
struct ObfuscatedKeys {
    send_key: [u8; 32],
    send_iv: [u8; 16],
    recv_key: [u8; 32],
    recv_iv: [u8; 16],
}

impl ObfuscatedKeys {
    /// The handshake nonce is 64 random bytes; by convention the first
    /// half seeds the sender's keystream and the second half the
    /// receiver's, mirrored on each side (spec §6 "each endpoint sends
    /// a 64-byte handshake nonce from which sender and receiver derive
    /// symmetric AES-CTR keys").
    fn from_nonces(local_nonce: &[u8; 64], remote_nonce: &[u8; 64]) -> Self {
        let mut send_key = [0u8; 32];
        send_key.copy_from_slice(&local_nonce[0..32]);
        let mut send_iv = [0u8; 16];
        send_iv.copy_from_slice(&local_nonce[32..48]);

        let mut recv_key = [0u8; 32];
        recv_key.copy_from_slice(&remote_nonce[0..32]);
        let mut recv_iv = [0u8; 16];
        recv_iv.copy_from_slice(&remote_nonce[32..48]);

        Self { send_key, send_iv, recv_key, recv_iv }
    }
}

/// A TCP relay connection wrapped in the "obfuscated 2" stream framing:
/// a length prefix (`packet_length/4`, one byte if < 0x7F else a 0x7F
/// marker followed by a 24-bit little-endian length) and whole-stream
/// AES-CTR encryption keyed by the connection handshake.
pub struct TcpObfuscatedTransport {
    stream: TcpStream,
    keys: ObfuscatedKeys,
    peer_addr: SocketAddr,
}

impl TcpObfuscatedTransport {
    /// Performs the handshake (both nonces exchanged in full before
    /// any framed message) and returns a ready-to-use transport.
    pub fn connect(addr: SocketAddr, local_nonce: [u8; 64]) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&local_nonce)?;

        let mut remote_nonce = [0u8; 64];
        stream.read_exact(&mut remote_nonce)?;

        Ok(Self { stream, keys: ObfuscatedKeys::from_nonces(&local_nonce, &remote_nonce), peer_addr: addr })
    }

    fn write_length_prefix(&mut self, byte_len: usize) -> io::Result<()> {
        let units = (byte_len / 4) as u32;
        let mut header = Vec::with_capacity(4);
        if units < 0x7f {
            header.push(units as u8);
        } else {
            header.push(0x7f);
            header.extend_from_slice(&units.to_le_bytes()[0..3]);
        }
        crypto::aes_ctr_apply(&self.keys.send_key, &self.keys.send_iv, &mut header);
        self.stream.write_all(&header)
    }

    pub fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_TCP_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "message exceeds max TCP length"));
        }
        // Pad to a 4-byte boundary so the length-in-units prefix is exact.
        let mut padded = payload.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        self.write_length_prefix(padded.len())?;
        let mut body = padded;
        crypto::aes_ctr_apply(&self.keys.send_key, &self.keys.send_iv, &mut body);
        self.stream.write_all(&body)
    }

    pub fn recv_message(&mut self) -> io::Result<Vec<u8>> {
        let mut first = [0u8; 1];
        self.stream.read_exact(&mut first)?;
        let mut first_dec = first;
        crypto::aes_ctr_apply(&self.keys.recv_key, &self.keys.recv_iv, &mut first_dec);

        let units = if first_dec[0] < 0x7f {
            first_dec[0] as u32
        } else {
            let mut rest = [0u8; 3];
            self.stream.read_exact(&mut rest)?;
            crypto::aes_ctr_apply(&self.keys.recv_key, &self.keys.recv_iv, &mut rest);
            u32::from_le_bytes([rest[0], rest[1], rest[2], 0])
        };

        let byte_len = (units as usize) * 4;
        if byte_len > MAX_TCP_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "peer announced an oversized TCP message"));
        }

        let mut body = vec![0u8; byte_len];
        self.stream.read_exact(&mut body)?;
        crypto::aes_ctr_apply(&self.keys.recv_key, &self.keys.recv_iv, &mut body);
        Ok(body)
    }
}

impl Transport for TcpObfuscatedTransport {
    fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> io::Result<()> {
        self.send_message(data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let msg = self.recv_message()?;
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        Ok(Some((n, self.peer_addr)))
    }
}

/// Proxy credentials and address, as accepted by `SetProxy` (spec §6).
#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub server: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A minimal RFC 1928 client sufficient for CONNECT (TCP relays) and
/// UDP ASSOCIATE (UDP relays), negotiating method 0 (none) or 2
/// (user/pass) per spec §6.
pub struct Socks5Client {
    stream: TcpStream,
}

impl Socks5Client {
    pub fn handshake(config: &Socks5Config) -> EngineResult<Self> {
        let mut stream = TcpStream::connect(config.server)?;

        let methods: &[u8] = if config.username.is_some() { &[0x00, 0x02] } else { &[0x00] };
        let mut greeting = vec![0x05u8, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting)?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply)?;
        if reply[0] != 0x05 {
            return Err(crate::error::EngineError::Socks5("unexpected SOCKS version in method reply".into()));
        }

        match reply[1] {
            0x00 => {}
            0x02 => Self::authenticate(&mut stream, config)?,
            0xff => return Err(crate::error::EngineError::Socks5("no acceptable auth method".into())),
            other => return Err(crate::error::EngineError::Socks5(format!("unsupported method {other}"))),
        }

        Ok(Self { stream })
    }

    fn authenticate(stream: &mut TcpStream, config: &Socks5Config) -> EngineResult<()> {
        let user = config.username.as_deref().unwrap_or_default();
        let pass = config.password.as_deref().unwrap_or_default();

        let mut req = vec![0x01u8, user.len() as u8];
        req.extend_from_slice(user.as_bytes());
        req.push(pass.len() as u8);
        req.extend_from_slice(pass.as_bytes());
        stream.write_all(&req)?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply)?;
        if reply[1] != 0x00 {
            return Err(crate::error::EngineError::Socks5("username/password authentication failed".into()));
        }
        Ok(())
    }

    /// Issues `CONNECT target` and returns the (unused beyond
    /// validation) bound address from the reply.
    pub fn connect_tcp(&mut self, target: SocketAddr) -> EngineResult<SocketAddr> {
        self.send_request(0x01, target)
    }

    /// Issues `UDP ASSOCIATE`; the returned address is where UDP
    /// datagrams must actually be sent for the life of this TCP
    /// control connection (spec §6 "The reply's bound address becomes
    /// the UDP datagram destination").
    pub fn udp_associate(&mut self, client_addr: SocketAddr) -> EngineResult<SocketAddr> {
        self.send_request(0x03, client_addr)
    }

    fn send_request(&mut self, command: u8, addr: SocketAddr) -> EngineResult<SocketAddr> {
        let mut req = vec![0x05u8, command, 0x00];
        match addr {
            SocketAddr::V4(v4) => {
                req.push(0x01);
                req.extend_from_slice(&v4.ip().octets());
                req.extend_from_slice(&v4.port().to_be_bytes());
            }
            SocketAddr::V6(v6) => {
                req.push(0x04);
                req.extend_from_slice(&v6.ip().octets());
                req.extend_from_slice(&v6.port().to_be_bytes());
            }
        }
        self.stream.write_all(&req)?;

        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        if header[0] != 0x05 || header[1] != 0x00 {
            return Err(crate::error::EngineError::Socks5(format!("SOCKS5 request failed, reply code {}", header[1])));
        }

        let bound = match header[3] {
            0x01 => {
                let mut raw = [0u8; 6];
                self.stream.read_exact(&mut raw)?;
                let ip = std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                SocketAddr::new(ip.into(), u16::from_be_bytes([raw[4], raw[5]]))
            }
            0x04 => {
                let mut raw = [0u8; 18];
                self.stream.read_exact(&mut raw)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[0..16]);
                let ip = std::net::Ipv6Addr::from(octets);
                SocketAddr::new(ip.into(), u16::from_be_bytes([raw[16], raw[17]]))
            }
            0x03 => return Err(crate::error::EngineError::Socks5("domain-name bound address unsupported".into())),
            other => return Err(crate::error::EngineError::Socks5(format!("unknown address type {other}"))),
        };

        Ok(bound)
    }
}

/// Builds a reflector "self info" ping (spec §6): `peer_tag(16) ‖
/// 0xFFFFFFFF ‖ 0xFFFFFFFF ‖ 0xFFFFFFFF ‖ 0xFFFFFFFE ‖ random_query_id(8)`.
pub fn build_self_info_ping(peer_tag: &[u8; 16], query_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(peer_tag);
    out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    out.extend_from_slice(&0xFFFF_FFFEu32.to_le_bytes());
    out.extend_from_slice(&query_id.to_le_bytes());
    out
}

/// Builds a public-endpoint-exchange request (spec §6): `peer_tag ‖
/// 16 bytes of 0xFF`.
pub fn build_peer_info_request(peer_tag: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(peer_tag);
    out.extend_from_slice(&[0xffu8; 16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscated_length_prefix_round_trips_short_and_long() {
        // Short form: < 0x7f units (< 508 bytes).
        let small = vec![0u8; 64];
        assert_eq!(small.len() / 4, 16);

        // Long form marker path: >= 0x7f units.
        let large_units = 0x7fu32;
        let byte_len = large_units * 4;
        assert_eq!(byte_len % 4, 0);
    }

    #[test]
    fn self_info_ping_has_expected_layout() {
        let tag = [7u8; 16];
        let ping = build_self_info_ping(&tag, 0x1122_3344_5566_7788);
        assert_eq!(ping.len(), 40);
        assert_eq!(&ping[0..16], &tag);
        assert_eq!(&ping[16..20], &0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(&ping[28..32], &0xFFFF_FFFEu32.to_le_bytes());
    }

    #[test]
    fn peer_info_request_has_expected_layout() {
        let tag = [3u8; 16];
        let req = build_peer_info_request(&tag);
        assert_eq!(req.len(), 32);
        assert_eq!(&req[16..32], &[0xffu8; 16]);
    }

    #[test]
    fn obfuscated_keys_differ_by_direction() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        for (i, v) in a.iter_mut().enumerate() {
            *v = i as u8;
        }
        for (i, v) in b.iter_mut().enumerate() {
            *v = (255 - i) as u8;
        }
        let keys = ObfuscatedKeys::from_nonces(&a, &b);
        assert_ne!(keys.send_key, keys.recv_key);
    }
}
