//! LAN discovery: UDP multicast beacons while advertising, a sighting table while browsing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use selfie_core::error::DiscoveryError;
use selfie_core::transport::{TransportEvent, TransportEventSender};
use selfie_core::wire::{decode_frame, encode_frame};
use selfie_core::{LocalIdentity, Message, PeerIdentity, PublicKey, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(8);

/// Where a browsed peer can be reached.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub public_key: PublicKey,
    pub addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Default)]
struct DiscoveryState {
    advertising: Option<String>,
    browsing: Option<String>,
    sightings: HashMap<PeerIdentity, Sighting>,
    socket: Option<Arc<UdpSocket>>,
}

/// Multicast advertiser/browser. The socket and its loops start on first use.
#[derive(Clone)]
pub struct Discovery {
    local: Arc<LocalIdentity>,
    discovery_port: u16,
    transport_port: u16,
    events: TransportEventSender,
    state: Arc<Mutex<DiscoveryState>>,
}

impl Discovery {
    pub fn new(
        local: Arc<LocalIdentity>,
        discovery_port: u16,
        transport_port: u16,
        events: TransportEventSender,
    ) -> Self {
        Self {
            local,
            discovery_port,
            transport_port,
            events,
            state: Arc::new(Mutex::new(DiscoveryState::default())),
        }
    }

    pub async fn advertise(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.ensure_socket()
            .await
            .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?;
        self.state.lock().await.advertising = Some(service_type.to_string());
        info!(service = service_type, "beaconing");
        Ok(())
    }

    pub async fn stop_advertising(&self) {
        self.state.lock().await.advertising = None;
    }

    pub async fn is_advertising(&self) -> bool {
        self.state.lock().await.advertising.is_some()
    }

    pub async fn browse(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.ensure_socket()
            .await
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;
        let mut s = self.state.lock().await;
        s.browsing = Some(service_type.to_string());
        s.sightings.clear();
        Ok(())
    }

    pub async fn stop_browsing(&self) {
        let mut s = self.state.lock().await;
        s.browsing = None;
        s.sightings.clear();
    }

    pub async fn lookup(&self, peer: &PeerIdentity) -> Option<Sighting> {
        self.state.lock().await.sightings.get(peer).cloned()
    }

    /// Mark as advertising without opening the multicast socket.
    #[cfg(test)]
    pub(crate) async fn advertise_without_socket(&self, service_type: &str) {
        self.state.lock().await.advertising = Some(service_type.to_string());
    }

    async fn ensure_socket(&self) -> std::io::Result<()> {
        let mut s = self.state.lock().await;
        if s.socket.is_some() {
            return Ok(());
        }
        let socket = Arc::new(make_multicast_socket(self.discovery_port)?);
        s.socket = Some(socket.clone());
        drop(s);

        tokio::spawn(beacon_loop(self.clone(), socket.clone()));
        tokio::spawn(recv_loop(self.clone(), socket));
        tokio::spawn(peer_timeout_loop(self.clone()));
        Ok(())
    }

    async fn on_beacon(&self, msg: Message, from: SocketAddr) {
        let mut s = self.state.lock().await;
        let Some(service) = s.browsing.clone() else {
            return;
        };
        let Some((identity, sighting)) = accept_beacon(&self.local, &service, msg, from) else {
            return;
        };
        let is_new = s.sightings.insert(identity.clone(), sighting).is_none();
        drop(s);
        if is_new {
            debug!(peer = %identity, addr = %from, "peer sighted");
            let _ = self.events.send(TransportEvent::PeerDiscovered(identity));
        }
    }
}

fn beacon_for(local: &LocalIdentity, service_type: &str, listen_port: u16) -> Message {
    Message::Beacon {
        protocol_version: PROTOCOL_VERSION,
        service_type: service_type.to_string(),
        identity: local.peer().clone(),
        device_id: local.keypair().device_id(),
        public_key: local.keypair().public_key().clone(),
        listen_port,
    }
}

/// Keep a beacon only if it is for our service and protocol and not our own.
fn accept_beacon(
    local: &LocalIdentity,
    service: &str,
    msg: Message,
    from: SocketAddr,
) -> Option<(PeerIdentity, Sighting)> {
    let Message::Beacon {
        protocol_version,
        service_type,
        identity,
        device_id,
        public_key,
        listen_port,
    } = msg
    else {
        return None;
    };
    if protocol_version != PROTOCOL_VERSION
        || service_type != service
        || device_id == local.keypair().device_id()
    {
        return None;
    }
    Some((
        identity,
        Sighting {
            public_key,
            addr: SocketAddr::new(from.ip(), listen_port),
            last_seen: Instant::now(),
        },
    ))
}

/// Remove sightings older than `timeout`; returns the peers removed.
fn expire_sightings(
    sightings: &mut HashMap<PeerIdentity, Sighting>,
    now: Instant,
    timeout: Duration,
) -> Vec<PeerIdentity> {
    let stale: Vec<PeerIdentity> = sightings
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_seen) >= timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        sightings.remove(id);
    }
    stale
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(discovery: Discovery, socket: Arc<UdpSocket>) {
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery.discovery_port));
    loop {
        let service = discovery.state.lock().await.advertising.clone();
        if let Some(service) = service {
            match encode_frame(&beacon_for(&discovery.local, &service, discovery.transport_port)) {
                Ok(frame) => {
                    if let Err(e) = socket.send_to(&frame, dest).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                Err(e) => warn!(error = %e, "beacon encode failed"),
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(discovery: Discovery, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if let Ok((msg, _)) = decode_frame(&buf[..n]) {
                    discovery.on_beacon(msg, from).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                return;
            }
        }
    }
}

async fn peer_timeout_loop(discovery: Discovery) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let lost = {
            let mut s = discovery.state.lock().await;
            expire_sightings(&mut s.sightings, Instant::now(), PEER_TIMEOUT)
        };
        for peer in lost {
            debug!(peer = %peer, "peer beacon timed out");
            let _ = discovery.events.send(TransportEvent::PeerLost(peer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfie_core::Keypair;

    fn from() -> SocketAddr {
        "192.168.1.20:45690".parse().unwrap()
    }

    fn beacon_of(local: &LocalIdentity, service: &str) -> Message {
        beacon_for(local, service, 45691)
    }

    #[test]
    fn beacon_for_our_service_is_accepted() {
        let me = LocalIdentity::generate("me");
        let other = LocalIdentity::generate("other");
        let (id, sighting) =
            accept_beacon(&me, "selfie-share", beacon_of(&other, "selfie-share"), from()).unwrap();
        assert_eq!(&id, other.peer());
        assert_eq!(sighting.addr, "192.168.1.20:45691".parse().unwrap());
    }

    #[test]
    fn foreign_service_and_old_protocol_are_ignored() {
        let me = LocalIdentity::generate("me");
        let other = LocalIdentity::generate("other");
        assert!(accept_beacon(&me, "selfie-share", beacon_of(&other, "chat"), from()).is_none());

        let kp = Keypair::generate();
        let old = Message::Beacon {
            protocol_version: PROTOCOL_VERSION + 1,
            service_type: "selfie-share".into(),
            identity: "old".into(),
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            listen_port: 1,
        };
        assert!(accept_beacon(&me, "selfie-share", old, from()).is_none());
        assert!(accept_beacon(&me, "selfie-share", Message::Leave, from()).is_none());
    }

    #[test]
    fn own_beacon_is_ignored() {
        let me = LocalIdentity::generate("me");
        assert!(accept_beacon(&me, "selfie-share", beacon_of(&me, "selfie-share"), from()).is_none());
    }

    #[test]
    fn stale_sightings_expire() {
        let me = LocalIdentity::generate("me");
        let other = LocalIdentity::generate("other");
        let (id, sighting) =
            accept_beacon(&me, "selfie-share", beacon_of(&other, "selfie-share"), from()).unwrap();
        let mut table = HashMap::new();
        table.insert(id.clone(), sighting);
        let now = Instant::now();
        assert!(expire_sightings(&mut table, now, PEER_TIMEOUT).is_empty());
        let later = now + PEER_TIMEOUT;
        assert_eq!(expire_sightings(&mut table, later, PEER_TIMEOUT), vec![id]);
        assert!(table.is_empty());
    }
}
