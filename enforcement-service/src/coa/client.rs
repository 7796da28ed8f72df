//! UDP transport for Disconnect-Request / CoA-Request.

use async_trait::async_trait;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::packet::{Attribute, Packet, PacketCode};
use super::{CoaAction, CoaTarget, CoaTransport, DeviceReply};

/// Sends a single datagram per call and waits up to `timeout` for the reply.
#[derive(Debug, Clone)]
pub struct RadiusCoaClient {
    timeout: Duration,
}

impl RadiusCoaClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_request(target: &CoaTarget, username: &str, action: &CoaAction) -> Packet {
        let code = match action {
            CoaAction::Disconnect => PacketCode::DisconnectRequest,
            CoaAction::SetRateLimit(_) => PacketCode::CoaRequest,
        };
        let identifier = rand::thread_rng().gen::<u8>();

        let mut packet = Packet::new(code, identifier)
            .with(Attribute::UserName(username.to_string()))
            .with(Attribute::AcctSessionId(target.session_id.clone()));
        if let Some(ip) = target
            .framed_ip
            .as_deref()
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
        {
            packet = packet.with(Attribute::FramedIpAddress(ip));
        }
        if let CoaAction::SetRateLimit(rate) = action {
            packet = packet.with(Attribute::MikrotikRateLimit(rate.clone()));
        }
        packet
    }
}

#[async_trait]
impl CoaTransport for RadiusCoaClient {
    async fn send(&self, target: &CoaTarget, username: &str, action: &CoaAction) -> DeviceReply {
        let ip: IpAddr = match target.nas_address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(nas_address = %target.nas_address, "Invalid NAS address");
                return DeviceReply::NoResponse;
            }
        };
        let peer = SocketAddr::new(ip, target.port);

        let request = Self::build_request(target, username, action);
        let secret = target.secret.as_bytes();
        let (datagram, request_authenticator) = match request.encode_request(secret) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode CoA request");
                return DeviceReply::NoResponse;
            }
        };

        let bind_addr = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Failed to bind CoA socket");
                return DeviceReply::NoResponse;
            }
        };
        if let Err(e) = socket.send_to(&datagram, peer).await {
            warn!(peer = %peer, error = %e, "Failed to send CoA request");
            return DeviceReply::NoResponse;
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 4096];
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => return DeviceReply::NoResponse,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "CoA socket error");
                    return DeviceReply::NoResponse;
                }
                Ok(Ok(received)) => received,
            };
            if from.ip() != peer.ip() {
                debug!(from = %from, "Ignoring datagram from unexpected peer");
                continue;
            }

            let reply = match Packet::decode_response(&buf[..len], &request_authenticator, secret) {
                Ok(reply) if reply.identifier == request.identifier => reply,
                Ok(_) => {
                    debug!("Ignoring reply with stale identifier");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring undecodable reply");
                    continue;
                }
            };

            if reply.code == request.code.ack() {
                return DeviceReply::Ack;
            }
            if reply.code == request.code.nak() {
                return DeviceReply::Nak {
                    error_cause: reply.error_cause(),
                };
            }
            debug!(code = reply.code.as_u8(), "Ignoring reply with unexpected code");
        }
    }
}
