//! Peer session manager: the command/event contract exposed to the UI layer.
//!
//! One control task owns the session and is its only writer. Transport callbacks,
//! UI commands, broadcast reports and timers all arrive as messages on channels that
//! this task drains, so mutations are applied serially and in arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::config::SessionConfig;
use crate::error::{HandshakeError, SessionError};
use crate::identity::{LocalIdentity, PeerIdentity};
use crate::invitation::InvitationId;
use crate::payload::{Payload, PayloadKind};
use crate::roster::{ConnectionState, Peer};
use crate::session::{Activity, Session, SessionEvent};
use crate::transport::{DiscoveryTransport, Reliability, TransportEvent, TransportEvents};

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

enum Command {
    StartHosting,
    StopHosting,
    JoinSession,
    LeaveSession,
    Invite {
        peer: PeerIdentity,
        context: Option<Vec<u8>>,
    },
    Decide {
        id: InvitationId,
        accept: bool,
    },
    Broadcast(Payload),
    Forget(PeerIdentity),
    ListConnections(oneshot::Sender<Vec<PeerIdentity>>),
    Roster(oneshot::Sender<Vec<Peer>>),
    Discovered(oneshot::Sender<Vec<PeerIdentity>>),
    FindInvitation(String, oneshot::Sender<Option<InvitationId>>),
    Activity(oneshot::Sender<Activity>),
    Shutdown(oneshot::Sender<()>),
}

/// Results of work the control task handed off to other tasks.
enum Internal {
    InviteFinished {
        peer: PeerIdentity,
        result: Result<(), HandshakeError>,
    },
    InvitationExpired(InvitationId),
}

/// Cloneable handle for issuing commands. Commands never fail synchronously except with
/// [`SessionError::Closed`] once the manager is gone; outcomes arrive as events.
#[derive(Clone)]
pub struct SessionHandle {
    local: PeerIdentity,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// Begin advertising. Idempotent while already advertising.
    pub fn start_hosting(&self) -> Result<(), SessionError> {
        self.send(Command::StartHosting)
    }

    /// Tear the session down (same as `leave_session`).
    pub fn stop_hosting(&self) -> Result<(), SessionError> {
        self.send(Command::StopHosting)
    }

    /// Begin browsing for peers to invite.
    pub fn join_session(&self) -> Result<(), SessionError> {
        self.send(Command::JoinSession)
    }

    pub fn leave_session(&self) -> Result<(), SessionError> {
        self.send(Command::LeaveSession)
    }

    /// Invite a discovered peer.
    pub fn invite(
        &self,
        peer: PeerIdentity,
        context: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.send(Command::Invite { peer, context })
    }

    /// Accept or decline an inbound invitation.
    pub fn decide(&self, id: InvitationId, accept: bool) -> Result<(), SessionError> {
        self.send(Command::Decide { id, accept })
    }

    /// Send to every currently connected peer. Completion arrives as `BroadcastFinished`.
    pub fn broadcast_data(&self, payload: Payload) -> Result<(), SessionError> {
        self.send(Command::Broadcast(payload))
    }

    /// Remove a Disconnected peer from the roster.
    pub fn forget_peer(&self, peer: PeerIdentity) -> Result<(), SessionError> {
        self.send(Command::Forget(peer))
    }

    /// Connected peers in roster order.
    pub async fn list_connections(&self) -> Result<Vec<PeerIdentity>, SessionError> {
        self.query(Command::ListConnections).await
    }

    pub async fn roster(&self) -> Result<Vec<Peer>, SessionError> {
        self.query(Command::Roster).await
    }

    pub async fn discovered_peers(&self) -> Result<Vec<PeerIdentity>, SessionError> {
        self.query(Command::Discovered).await
    }

    /// Resolve the short invitation id shown to users.
    pub async fn find_invitation(&self, prefix: &str) -> Result<Option<InvitationId>, SessionError> {
        let prefix = prefix.to_string();
        self.query(|tx| Command::FindInvitation(prefix, tx)).await
    }

    pub async fn activity(&self) -> Result<Activity, SessionError> {
        self.query(Command::Activity).await
    }

    /// Tear down any active session and stop the control task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.query(Command::Shutdown).await
    }

    fn send(&self, cmd: Command) -> Result<(), SessionError> {
        self.commands.send(cmd).map_err(|_| SessionError::Closed)
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Session orchestrator. [`PeerSessionManager::spawn`] starts the control task.
pub struct PeerSessionManager {
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    transport: Arc<dyn DiscoveryTransport>,
    session: Option<Session>,
    /// Outbound invitations still waiting on the remote decision.
    invites: Vec<(PeerIdentity, AbortHandle)>,
    broadcaster: Broadcaster,
    events: mpsc::UnboundedSender<SessionEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl PeerSessionManager {
    /// Validate the config and start the control task. Must be called inside a Tokio runtime.
    pub fn spawn(
        local: Arc<LocalIdentity>,
        config: SessionConfig,
        transport: Arc<dyn DiscoveryTransport>,
        transport_events: TransportEvents,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let broadcaster = Broadcaster::spawn(transport.clone(), Reliability::Reliable, reports_tx);
        let handle = SessionHandle {
            local: local.peer().clone(),
            commands: commands_tx,
        };
        let manager = PeerSessionManager {
            local,
            config,
            transport,
            session: None,
            invites: Vec::new(),
            broadcaster,
            events: events_tx,
            internal: internal_tx,
        };
        tokio::spawn(manager.run(commands_rx, transport_events, internal_rx, reports_rx));
        Ok((handle, events_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: TransportEvents,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut reports: mpsc::UnboundedReceiver<BroadcastReport>,
    ) {
        info!(identity = %self.local.peer(), "session manager started");
        let mut transport_open = true;
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Command::Shutdown(done) = cmd {
                        self.teardown("shutdown").await;
                        let _ = done.send(());
                        break;
                    }
                    self.on_command(cmd).await;
                }
                ev = transport_events.recv(), if transport_open => match ev {
                    Some(ev) => self.on_transport_event(ev),
                    None => {
                        warn!("transport event stream closed");
                        transport_open = false;
                    }
                },
                Some(msg) = internal.recv() => self.on_internal(msg),
                Some(report) = reports.recv() => self.on_broadcast_report(report),
            }
        }
        info!(identity = %self.local.peer(), "session manager stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartHosting => self.start_hosting().await,
            Command::JoinSession => self.join_session().await,
            Command::StopHosting => self.teardown("stop hosting").await,
            Command::LeaveSession => self.teardown("leave session").await,
            Command::Invite { peer, context } => self.invite(peer, context),
            Command::Decide { id, accept } => self.decide(id, accept),
            Command::Broadcast(payload) => self.broadcast(payload),
            Command::Forget(peer) => {
                if let Some(s) = self.session.as_mut() {
                    let events = s.forget(&peer);
                    self.publish(events);
                }
            }
            Command::ListConnections(reply) => {
                let peers = self
                    .session
                    .as_ref()
                    .map(Session::connected_peers)
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::Roster(reply) => {
                let peers = self
                    .session
                    .as_ref()
                    .map(|s| s.roster().all_peers())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::Discovered(reply) => {
                let peers = self
                    .session
                    .as_ref()
                    .map(|s| s.discovered_peers().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::FindInvitation(prefix, reply) => {
                let id = self
                    .session
                    .as_ref()
                    .and_then(|s| s.pending_invitations().find_by_prefix(&prefix));
                let _ = reply.send(id);
            }
            Command::Activity(reply) => {
                let _ = reply.send(self.activity());
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn start_hosting(&mut self) {
        if self.session.as_ref().is_some_and(Session::is_advertising) {
            debug!("start hosting: already advertising");
            return;
        }
        match self
            .transport
            .start_advertising(&self.config.service_type)
            .await
        {
            Ok(()) => {
                info!(service = %self.config.service_type, "advertising started");
                self.session
                    .get_or_insert_with(Session::new)
                    .set_advertising(true);
                self.publish_activity();
            }
            Err(e) => {
                error!(error = %e, "advertising failed");
                self.publish(vec![SessionEvent::Error(e.into())]);
            }
        }
    }

    async fn join_session(&mut self) {
        if self.session.as_ref().is_some_and(Session::is_browsing) {
            debug!("join session: already browsing");
            return;
        }
        // The session must exist before discoveries start flowing in.
        let created = self.session.is_none();
        self.session
            .get_or_insert_with(Session::new)
            .set_browsing(true);
        match self.transport.start_browsing(&self.config.service_type).await {
            Ok(()) => {
                info!(service = %self.config.service_type, "browsing started");
                self.publish_activity();
            }
            Err(e) => {
                error!(error = %e, "browsing failed");
                if created {
                    self.session = None;
                } else if let Some(s) = self.session.as_mut() {
                    s.set_browsing(false);
                }
                self.publish(vec![SessionEvent::Error(e.into())]);
            }
        }
    }

    async fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            debug!(reason, "teardown: no active session");
            return;
        };
        info!(reason, "tearing down session");
        self.broadcaster.cancel_pending();
        let cancelled = self.cancel_invites();
        if session.is_advertising() {
            self.transport.stop_advertising().await;
        }
        if session.is_browsing() {
            self.transport.stop_browsing().await;
        }
        self.transport.disconnect().await;
        let mut events = session.teardown();
        events.extend(
            cancelled
                .into_iter()
                .map(|peer| SessionEvent::Error(HandshakeError::Cancelled(peer).into())),
        );
        self.publish(events);
        self.publish_activity();
    }

    fn invite(&mut self, peer: PeerIdentity, context: Option<Vec<u8>>) {
        let Some(session) = self.session.as_ref() else {
            self.publish(vec![SessionEvent::Error(HandshakeError::NoSession.into())]);
            return;
        };
        if !session.is_discovered(&peer) {
            self.publish(vec![SessionEvent::Error(
                HandshakeError::UnknownPeer(peer).into(),
            )]);
            return;
        }
        info!(peer = %peer, "inviting peer");
        let transport = self.transport.clone();
        let internal = self.internal.clone();
        let target = peer.clone();
        let task = tokio::spawn(async move {
            let result = transport.invite(&target, context).await;
            let _ = internal.send(Internal::InviteFinished {
                peer: target,
                result,
            });
        });
        self.invites.retain(|(_, h)| !h.is_finished());
        self.invites.push((peer, task.abort_handle()));
    }

    /// Abort outbound invitations still in flight. Returns the peers they targeted.
    fn cancel_invites(&mut self) -> Vec<PeerIdentity> {
        self.invites
            .drain(..)
            .filter(|(_, h)| !h.is_finished())
            .map(|(peer, h)| {
                h.abort();
                debug!(peer = %peer, "outbound invitation cancelled");
                peer
            })
            .collect()
    }

    fn decide(&mut self, id: InvitationId, accept: bool) {
        let result = match self.session.as_mut() {
            Some(s) => s.decide(id, accept),
            None => Err(HandshakeError::UnknownInvitation(id)),
        };
        match result {
            Ok(peer) => info!(peer = %peer, accept, "invitation answered"),
            Err(e) => {
                warn!(error = %e, "invitation decision failed");
                self.publish(vec![SessionEvent::Error(e.into())]);
            }
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        let peers = self
            .session
            .as_ref()
            .map(Session::connected_peers)
            .unwrap_or_default();
        debug!(peers = peers.len(), bytes = payload.len(), "broadcast queued");
        let mut jobs = vec![payload.bytes().to_vec()];
        if self.config.announce_provenance && payload.kind() == PayloadKind::Image {
            jobs.push(Payload::provenance(self.local.peer()).bytes().to_vec());
        }
        for bytes in jobs {
            if self.broadcaster.submit(bytes, peers.clone()).is_err() {
                error!("broadcast worker is gone");
                self.publish(vec![SessionEvent::Error(SessionError::Closed)]);
                return;
            }
        }
    }

    fn on_transport_event(&mut self, ev: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            match ev {
                TransportEvent::InvitationReceived { mut responder, .. } => {
                    debug!(from = %responder.from(), "declining invitation while idle");
                    let _ = responder.respond(false);
                }
                TransportEvent::PeerStateChanged {
                    peer,
                    state: ConnectionState::Connecting | ConnectionState::Connected,
                } => {
                    warn!(peer = %peer, "link came up while idle, dropping it");
                    let transport = self.transport.clone();
                    tokio::spawn(async move { transport.disconnect_peer(&peer).await });
                }
                other => debug!(event = ?other, "transport event while idle, ignored"),
            }
            return;
        };
        let events = match ev {
            TransportEvent::PeerDiscovered(peer) => session.on_peer_discovered(peer),
            TransportEvent::PeerLost(peer) => session.on_peer_lost(peer),
            TransportEvent::InvitationReceived { request, responder } => {
                if let Some(timeout) = self.config.invitation_timeout() {
                    let internal = self.internal.clone();
                    let id = request.id;
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = internal.send(Internal::InvitationExpired(id));
                    });
                }
                session.on_invitation(request, responder)
            }
            TransportEvent::PeerStateChanged { peer, state } => session.on_peer_state(peer, state),
            TransportEvent::DataReceived { peer, bytes } => session.on_data(peer, bytes),
        };
        self.publish(events);
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::InviteFinished { peer, .. } if self.session.is_none() => {
                debug!(peer = %peer, "invitation finished after teardown, ignored");
            }
            Internal::InviteFinished { peer, result } => match result {
                Ok(()) => info!(peer = %peer, "invitation accepted"),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "invitation failed");
                    self.publish(vec![SessionEvent::Error(e.into())]);
                }
            },
            Internal::InvitationExpired(id) => {
                if let Some(s) = self.session.as_mut() {
                    let events = s.expire(id);
                    self.publish(events);
                }
            }
        }
    }

    fn on_broadcast_report(&mut self, report: BroadcastReport) {
        let mut events: Vec<SessionEvent> = report
            .failed
            .iter()
            .cloned()
            .map(|e| SessionEvent::Error(e.into()))
            .collect();
        events.push(SessionEvent::BroadcastFinished(report));
        self.publish(events);
    }

    fn activity(&self) -> Activity {
        self.session
            .as_ref()
            .map(Session::activity)
            .unwrap_or(Activity::Idle)
    }

    fn publish_activity(&self) {
        self.publish(vec![SessionEvent::ActivityChanged(self.activity())]);
    }

    fn publish(&self, events: Vec<SessionEvent>) {
        for ev in events {
            if self.events.send(ev).is_err() {
                debug!("no event consumer");
                return;
            }
        }
    }
}
