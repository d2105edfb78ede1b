//! Blocking framed TCP endpoint.
//!
//! Remoted calls are synchronous from the client's point of view and the
//! daemon pipeline is thread-per-client, so transport is plain blocking IO:
//! one frame out, one frame in.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use shade_protocol::wire::{self, FrameHeader, FRAME_HEADER_LEN};
use shade_protocol::Message;

use crate::error::TransportError;

const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// One framed, bidirectional connection to a peer (daemon, agent, or CLI).
pub struct FramedEndpoint {
    stream: TcpStream,
}

impl FramedEndpoint {
    /// Connect to a remote endpoint, retrying a few times to ride out
    /// daemon startup races.
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        let mut last = String::new();
        for attempt in 0..MAX_CONNECT_RETRIES {
            if attempt > 0 {
                std::thread::sleep(RETRY_DELAY);
            }
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    debug!(addr, "connected");
                    return Ok(Self { stream });
                }
                Err(e) => last = e.to_string(),
            }
        }
        Err(TransportError::Connect {
            addr: addr.to_string(),
            attempts: MAX_CONNECT_RETRIES,
            last,
        })
    }

    /// Connect with an explicit timeout per attempt.
    pub fn connect_timeout(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let sockaddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Connect {
                addr: addr.to_string(),
                attempts: 0,
                last: "no resolvable address".to_string(),
            })?;
        let stream = TcpStream::connect_timeout(&sockaddr, timeout)?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }

    /// Wrap an accepted stream (daemon side).
    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self { stream }
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Send one message as a frame.
    pub fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let frame = wire::encode_frame(msg)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Receive one message, blocking until a full frame arrives.
    pub fn recv(&mut self) -> Result<Message, TransportError> {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = self.stream.read_exact(&mut raw) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(TransportError::Closed);
            }
            return Err(e.into());
        }

        let header = FrameHeader::decode(&raw)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        self.stream.read_exact(&mut payload)?;

        Ok(wire::decode_payload(&payload, &header)?)
    }

    /// One request/reply exchange.
    pub fn call(&mut self, msg: &Message) -> Result<Message, TransportError> {
        self.send(msg)?;
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn loopback_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ep = FramedEndpoint::from_stream(stream);
            match ep.recv().unwrap() {
                Message::Hello { protocol_version, name } => {
                    assert_eq!(name, "test");
                    ep.send(&Message::OobAck {
                        code: protocol_version as i32,
                        message: String::new(),
                    })
                    .unwrap();
                }
                other => panic!("unexpected: {other:?}"),
            }
        });

        let mut ep = FramedEndpoint::connect(&addr.to_string()).unwrap();
        let reply = ep
            .call(&Message::Hello {
                protocol_version: 2,
                name: "test".to_string(),
            })
            .unwrap();
        assert!(matches!(reply, Message::OobAck { code: 2, .. }));
        server.join().unwrap();
    }
}
