//! Line-oriented console: parses commands from stdin and renders session events.

use std::path::{Path, PathBuf};

use selfie_core::payload::sniff_image;
use selfie_core::{ConnectionState, Payload, PeerIdentity, ReceivedPayload, SessionEvent};

pub const HELP: &str = "\
commands:
  peers              discovered peers
  list               roster with connection states
  invite <peer> [msg]
  accept <id>        accept an invitation
  decline <id>
  send <path>        broadcast an image (or text) file
  say <text>         broadcast a text message
  forget <peer>      drop a disconnected peer from the roster
  host | join | leave | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Peers,
    List,
    Invite {
        peer: PeerIdentity,
        message: Option<String>,
    },
    Accept(String),
    Decline(String),
    Send(PathBuf),
    Say(String),
    Forget(PeerIdentity),
    Host,
    Join,
    Leave,
    Quit,
    Help,
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let need = |what: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("{word}: missing {what}"))
        } else {
            Ok(rest.to_string())
        }
    };
    let cmd = match word {
        "peers" => ConsoleCommand::Peers,
        "list" => ConsoleCommand::List,
        "invite" => {
            let arg = need("peer")?;
            let (peer, message) = split_peer(&arg);
            ConsoleCommand::Invite {
                peer: PeerIdentity::new(peer),
                message,
            }
        }
        "accept" => ConsoleCommand::Accept(need("invitation id")?),
        "decline" => ConsoleCommand::Decline(need("invitation id")?),
        "send" => ConsoleCommand::Send(PathBuf::from(need("path")?)),
        "say" => ConsoleCommand::Say(need("text")?),
        "forget" => ConsoleCommand::Forget(PeerIdentity::new(need("peer")?)),
        "host" => ConsoleCommand::Host,
        "join" => ConsoleCommand::Join,
        "leave" => ConsoleCommand::Leave,
        "quit" | "exit" => ConsoleCommand::Quit,
        "help" | "?" => ConsoleCommand::Help,
        other => return Err(format!("unknown command {other:?} (try help)")),
    };
    Ok(Some(cmd))
}

/// Split `<peer> [msg]`. Display names may contain spaces, so the peer runs through the
/// word carrying the `#xxxx` suffix when there is one.
fn split_peer(arg: &str) -> (String, Option<String>) {
    let peer_end = match arg.find('#') {
        Some(hash) => arg[hash..]
            .find(char::is_whitespace)
            .map_or(arg.len(), |n| hash + n),
        None => arg.find(char::is_whitespace).unwrap_or(arg.len()),
    };
    let (peer, rest) = arg.split_at(peer_end);
    let message = Some(rest.trim()).filter(|m| !m.is_empty()).map(str::to_string);
    (peer.to_string(), message)
}

/// Image files go out as images; anything else must be UTF-8 text.
pub fn payload_from_file(bytes: Vec<u8>) -> Result<Payload, String> {
    if sniff_image(&bytes).is_some() {
        return Ok(Payload::image(bytes));
    }
    String::from_utf8(bytes)
        .map(Payload::text)
        .map_err(|_| "file is neither a PNG/JPEG/GIF image nor UTF-8 text".to_string())
}

/// Writes received images as `received-<n>.<ext>`, counting up from 1.
pub struct ImageSink {
    dir: PathBuf,
    count: u32,
}

impl ImageSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, count: 0 }
    }

    pub fn next_path(&mut self, ext: &str) -> PathBuf {
        self.count += 1;
        self.dir.join(format!("received-{}.{}", self.count, ext))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// One-line rendering for events that need no side effects.
pub fn render(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::RosterChanged(peers) => {
            let parts: Vec<String> = peers
                .iter()
                .map(|p| format!("{}={}", p.identity, state_label(p.state)))
                .collect();
            format!("roster: [{}]", parts.join(", "))
        }
        SessionEvent::PeerDisconnected(p) => format!("{p} disconnected"),
        SessionEvent::PeerDiscovered(p) => format!("found {p}"),
        SessionEvent::PeerLost(p) => format!("lost {p}"),
        SessionEvent::InvitationReceived(req) => {
            let note = req
                .context
                .as_deref()
                .map(|c| format!(" ({})", String::from_utf8_lossy(c)))
                .unwrap_or_default();
            format!(
                "invitation {} from {}{} -- accept {} / decline {}",
                req.id, req.from, note, req.id, req.id
            )
        }
        SessionEvent::DataReceived {
            from,
            payload: ReceivedPayload::Text(text),
        } => format!("<{from}> {text}"),
        SessionEvent::DataReceived { .. } => return None,
        SessionEvent::BroadcastFinished(report) => format!(
            "sent to {}/{} peer(s)",
            report.delivered.len(),
            report.attempted()
        ),
        SessionEvent::ActivityChanged(activity) => format!("activity: {activity:?}"),
        SessionEvent::Error(e) => format!("error [{}]: {}", e.kind(), e.detail()),
    };
    Some(line)
}

pub fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Disconnected => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfie_core::{HandshakeError, Peer, SessionError};

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse_line("  "), Ok(None));
        assert_eq!(parse_line("peers"), Ok(Some(ConsoleCommand::Peers)));
        assert_eq!(
            parse_line("invite Bob#1a2b come over"),
            Ok(Some(ConsoleCommand::Invite {
                peer: "Bob#1a2b".into(),
                message: Some("come over".into())
            }))
        );
        assert_eq!(
            parse_line("say hello there"),
            Ok(Some(ConsoleCommand::Say("hello there".into())))
        );
        assert_eq!(
            parse_line("send /tmp/me.png"),
            Ok(Some(ConsoleCommand::Send("/tmp/me.png".into())))
        );
    }

    #[test]
    fn invite_accepts_display_names_with_spaces() {
        assert_eq!(
            parse_line("invite Alice Phone#1a2b see you there"),
            Ok(Some(ConsoleCommand::Invite {
                peer: "Alice Phone#1a2b".into(),
                message: Some("see you there".into())
            }))
        );
        assert_eq!(
            parse_line("invite Alice Phone#1a2b"),
            Ok(Some(ConsoleCommand::Invite {
                peer: "Alice Phone#1a2b".into(),
                message: None
            }))
        );
        assert_eq!(
            parse_line("invite Bob"),
            Ok(Some(ConsoleCommand::Invite {
                peer: "Bob".into(),
                message: None
            }))
        );
    }

    #[test]
    fn missing_arguments_and_unknown_words_are_errors() {
        assert!(parse_line("accept").is_err());
        assert!(parse_line("invite").is_err());
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn file_payloads_are_sniffed() {
        let jpeg = vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0xff, 0xd9];
        assert_eq!(
            payload_from_file(jpeg.clone()).unwrap(),
            Payload::image(jpeg)
        );
        assert_eq!(
            payload_from_file(b"notes".to_vec()).unwrap(),
            Payload::text("notes")
        );
        assert!(payload_from_file(vec![0xff, 0x00]).is_err());
    }

    #[test]
    fn image_names_count_up() {
        let mut sink = ImageSink::new(PathBuf::from("/tmp/out"));
        assert_eq!(sink.next_path("png"), PathBuf::from("/tmp/out/received-1.png"));
        assert_eq!(sink.next_path("jpg"), PathBuf::from("/tmp/out/received-2.jpg"));
    }

    #[test]
    fn renders_roster_and_errors() {
        let roster = SessionEvent::RosterChanged(vec![Peer {
            identity: "Bob".into(),
            state: ConnectionState::Connected,
        }]);
        assert_eq!(render(&roster).unwrap(), "roster: [Bob=connected]");
        let err = SessionEvent::Error(SessionError::from(HandshakeError::Declined("Bob".into())));
        assert_eq!(
            render(&err).unwrap(),
            "error [handshake]: Bob declined the invitation"
        );
    }
}
