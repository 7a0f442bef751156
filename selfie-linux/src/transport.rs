//! LAN transport: TCP listener for inbound invitations, outbound links to browsed peers,
//! hello + encrypted frames on every link.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use selfie_core::error::{DiscoveryError, HandshakeError, TransportError};
use selfie_core::invitation::invitation;
use selfie_core::transport::{
    DiscoveryTransport, Reliability, SendOutcome, TransportEvent, TransportEventSender,
    TransportEvents,
};
use selfie_core::{ConnectionState, LocalIdentity, Message, PeerIdentity};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::Discovery;
use crate::link::{hello_accept, hello_connect, SealedReader, SealedWriter};

/// How long a responder waits for the inviter to confirm an accepted invitation.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

enum LinkCommand {
    Send {
        payload: Vec<u8>,
        done: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    Confirm,
    Close,
}

struct LinkHandle {
    id: u64,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

type Links = Arc<Mutex<HashMap<PeerIdentity, LinkHandle>>>;

/// `DiscoveryTransport` over UDP multicast discovery and TCP peer links.
#[derive(Clone)]
pub struct LanTransport {
    local: Arc<LocalIdentity>,
    discovery: Discovery,
    links: Links,
    next_link: Arc<AtomicU64>,
    /// Bumped by `disconnect` under the links lock. A handshake only registers its link
    /// if the value is unchanged since it started.
    generation: Arc<AtomicU64>,
    events: TransportEventSender,
    port: u16,
}

impl LanTransport {
    /// Bind the link listener and return the transport with its event stream.
    pub async fn bind(
        local: Arc<LocalIdentity>,
        config: &Config,
    ) -> std::io::Result<(Self, TransportEvents)> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.transport_port)).await?;
        let port = listener.local_addr()?.port();
        let (events, events_rx) = mpsc::unbounded_channel();
        let discovery = Discovery::new(
            local.clone(),
            config.discovery_port,
            port,
            events.clone(),
        );
        let transport = LanTransport {
            local,
            discovery,
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            events,
            port,
        };
        info!(port, "link listener bound");
        tokio::spawn(transport.clone().accept_loop(listener));
        Ok((transport, events_rx))
    }

    /// Port the link listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound link");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.answer(stream).await {
                            debug!(%addr, error = %e, "inbound link dropped during handshake");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "link listener failed");
                    break;
                }
            }
        }
    }

    /// Responder side: hello, read the `Invite`, surface it, reply with the decision, then
    /// wait for the inviter to confirm before bringing the link up.
    async fn answer(self, mut stream: TcpStream) -> std::io::Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let (_remote, key) = hello_accept(&mut stream, self.local.keypair()).await?;
        let (r, w) = tokio::io::split(stream);
        let mut reader = SealedReader::new(r, key);
        let mut writer = SealedWriter::new(w, key);
        let Some(Message::Invite { identity, context }) = reader.recv().await? else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected an invitation",
            ));
        };
        if !self.discovery.is_advertising().await {
            debug!(from = %identity, "not advertising, declining invitation");
            writer.send(&Message::InviteReply { accepted: false }).await?;
            return writer.shutdown().await;
        }
        let (request, responder, decision) = invitation(identity.clone(), context);
        if self
            .events
            .send(TransportEvent::InvitationReceived { request, responder })
            .is_err()
        {
            return Ok(());
        }
        let accepted = decision.wait().await.unwrap_or(false)
            && self.generation.load(Ordering::SeqCst) == generation;
        writer.send(&Message::InviteReply { accepted }).await?;
        if !accepted {
            return writer.shutdown().await;
        }
        match tokio::time::timeout(CONFIRM_TIMEOUT, reader.recv()).await {
            Ok(Ok(Some(Message::InviteConfirm))) => {}
            _ => {
                debug!(from = %identity, "inviter went away before confirming");
                return writer.shutdown().await;
            }
        }
        if self.establish(identity.clone(), reader, writer, generation, false).await {
            info!(peer = %identity, "invitation accepted, link up");
        }
        Ok(())
    }

    /// Register the link, report it, and run it until it drops. Refuses, closing the
    /// stream, if `disconnect` ran since the handshake started.
    async fn establish(
        &self,
        peer: PeerIdentity,
        reader: SealedReader<ReadHalf<TcpStream>>,
        mut writer: SealedWriter<WriteHalf<TcpStream>>,
        generation: u64,
        confirm: bool,
    ) -> bool {
        let id = self.next_link.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut links = self.links.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(links);
                debug!(peer = %peer, "disconnected during handshake, closing link");
                let _ = writer.send(&Message::Leave).await;
                let _ = writer.shutdown().await;
                return false;
            }
            if confirm {
                let _ = tx.send(LinkCommand::Confirm);
            }
            if let Some(old) = links.insert(peer.clone(), LinkHandle { id, tx }) {
                debug!(peer = %peer, "replacing existing link");
                let _ = old.tx.send(LinkCommand::Close);
            }
            // Reported under the lock so a concurrent `disconnect` cannot overtake them.
            for state in [ConnectionState::Connecting, ConnectionState::Connected] {
                self.emit_state(&peer, state);
            }
        }
        tokio::spawn(write_loop(peer.clone(), writer, rx));
        let this = self.clone();
        tokio::spawn(async move { this.read_loop(peer, id, reader).await });
        true
    }

    async fn read_loop(self, peer: PeerIdentity, id: u64, mut reader: SealedReader<ReadHalf<TcpStream>>) {
        loop {
            match reader.recv().await {
                Ok(Some(Message::Data { payload })) => {
                    let _ = self.events.send(TransportEvent::DataReceived {
                        peer: peer.clone(),
                        bytes: payload,
                    });
                }
                Ok(Some(Message::Leave)) => {
                    debug!(peer = %peer, "peer left");
                    break;
                }
                Ok(Some(other)) => debug!(peer = %peer, message = ?other, "unexpected message on link"),
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "link read failed");
                    break;
                }
            }
        }
        // Whoever removes the link reports it; a link closed by `disconnect` is already gone.
        let mut links = self.links.lock().await;
        if links.get(&peer).is_some_and(|l| l.id == id) {
            if let Some(link) = links.remove(&peer) {
                let _ = link.tx.send(LinkCommand::Close);
            }
            drop(links);
            self.emit_state(&peer, ConnectionState::Disconnected);
        }
    }

    fn emit_state(&self, peer: &PeerIdentity, state: ConnectionState) {
        let _ = self.events.send(TransportEvent::PeerStateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

async fn write_loop(
    peer: PeerIdentity,
    mut writer: SealedWriter<WriteHalf<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LinkCommand::Send { payload, done } => {
                let result = writer
                    .send(&Message::Data { payload })
                    .await
                    .map_err(TransportError::from);
                if let Err(e) = &result {
                    debug!(peer = %peer, error = %e, "link write failed");
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            LinkCommand::Confirm => {
                if let Err(e) = writer.send(&Message::InviteConfirm).await {
                    debug!(peer = %peer, error = %e, "confirm write failed");
                }
            }
            LinkCommand::Close => {
                let _ = writer.send(&Message::Leave).await;
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

#[async_trait]
impl DiscoveryTransport for LanTransport {
    async fn start_advertising(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.discovery.advertise(service_type).await
    }

    async fn stop_advertising(&self) {
        self.discovery.stop_advertising().await
    }

    async fn start_browsing(&self, service_type: &str) -> Result<(), DiscoveryError> {
        self.discovery.browse(service_type).await
    }

    async fn stop_browsing(&self) {
        self.discovery.stop_browsing().await
    }

    async fn invite(
        &self,
        peer: &PeerIdentity,
        context: Option<Vec<u8>>,
    ) -> Result<(), HandshakeError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let sighting = self
            .discovery
            .lookup(peer)
            .await
            .ok_or_else(|| HandshakeError::UnknownPeer(peer.clone()))?;
        let rejected = |e: std::io::Error| HandshakeError::TransportRejected(e.to_string());

        let mut stream = TcpStream::connect(sighting.addr).await.map_err(rejected)?;
        let (remote, key) = hello_connect(&mut stream, self.local.keypair())
            .await
            .map_err(rejected)?;
        if remote.public_key != sighting.public_key {
            return Err(HandshakeError::TransportRejected(format!(
                "{} answered with a key it did not advertise",
                peer
            )));
        }
        let (r, w) = tokio::io::split(stream);
        let mut reader = SealedReader::new(r, key);
        let mut writer = SealedWriter::new(w, key);
        writer
            .send(&Message::Invite {
                identity: self.local.peer().clone(),
                context,
            })
            .await
            .map_err(rejected)?;
        match reader.recv().await.map_err(rejected)? {
            Some(Message::InviteReply { accepted: true }) => {
                if self.establish(peer.clone(), reader, writer, generation, true).await {
                    Ok(())
                } else {
                    Err(HandshakeError::Cancelled(peer.clone()))
                }
            }
            Some(Message::InviteReply { accepted: false }) => Err(HandshakeError::Declined(peer.clone())),
            Some(_) => Err(HandshakeError::TransportRejected(
                "unexpected reply to invitation".into(),
            )),
            None => Err(HandshakeError::Abandoned(peer.clone())),
        }
    }

    async fn send(
        &self,
        bytes: &[u8],
        to: &[PeerIdentity],
        reliability: Reliability,
    ) -> Vec<SendOutcome> {
        let mut pending = Vec::with_capacity(to.len());
        {
            let links = self.links.lock().await;
            for peer in to {
                let Some(link) = links.get(peer) else {
                    pending.push((peer.clone(), Err(TransportError::NotConnected)));
                    continue;
                };
                let (done, wait) = match reliability {
                    Reliability::Reliable => {
                        let (tx, rx) = oneshot::channel();
                        (Some(tx), Some(rx))
                    }
                    Reliability::Unreliable => (None, None),
                };
                let cmd = LinkCommand::Send {
                    payload: bytes.to_vec(),
                    done,
                };
                match link.tx.send(cmd) {
                    Ok(()) => pending.push((peer.clone(), Ok(wait))),
                    Err(_) => pending.push((peer.clone(), Err(TransportError::LinkClosed))),
                }
            }
        }
        // Every link got its frame queued above; their writers run concurrently.
        let mut outcomes = Vec::with_capacity(pending.len());
        for (peer, queued) in pending {
            let result = match queued {
                Ok(Some(wait)) => wait.await.unwrap_or(Err(TransportError::LinkClosed)),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            outcomes.push((peer, result));
        }
        outcomes
    }

    async fn disconnect(&self) {
        let mut links = self.links.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        for (peer, link) in links.drain() {
            let _ = link.tx.send(LinkCommand::Close);
            self.emit_state(&peer, ConnectionState::Disconnected);
        }
    }

    async fn disconnect_peer(&self, peer: &PeerIdentity) {
        let mut links = self.links.lock().await;
        if let Some(link) = links.remove(peer) {
            let _ = link.tx.send(LinkCommand::Close);
            self.emit_state(peer, ConnectionState::Disconnected);
        }
    }
}
