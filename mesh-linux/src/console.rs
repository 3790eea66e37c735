//! Terminal front end: slash commands in, rendered events out.

use mesh_core::{ChatMessage, MeshEvent, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::node::Node;

const HELP: &str = "\
/peers            list nearby devices
/invite N         invite device N from /peers
/accept, /decline answer a pending invitation
/end              end the chat (tells the other side)
/leave            drop the chat without telling anyone
/visible on|off   let others see this device
/browse on|off    look for other devices
/status           visibility and current chat
/transcript       show this chat so far
/quit             exit
anything else is sent as a message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Invite(usize),
    Accept,
    Decline,
    End,
    Leave,
    Visible(bool),
    Browse(bool),
    Status,
    Transcript,
    Help,
    Quit,
    Say(String),
    Unknown(String),
}

/// Parse one input line. Blank lines are `None`.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };
    let mut words = rest.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let arg = words.next();
    let toggle = |arg: Option<&str>| match arg {
        Some("on") => Some(true),
        Some("off") => Some(false),
        _ => None,
    };
    let parsed = match cmd {
        "peers" => Some(Command::Peers),
        "invite" => arg
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(Command::Invite),
        "accept" => Some(Command::Accept),
        "decline" => Some(Command::Decline),
        "end" => Some(Command::End),
        "leave" => Some(Command::Leave),
        "visible" => toggle(arg).map(Command::Visible),
        "browse" => toggle(arg).map(Command::Browse),
        "status" => Some(Command::Status),
        "transcript" => Some(Command::Transcript),
        "help" => Some(Command::Help),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    };
    Some(parsed.unwrap_or_else(|| Command::Unknown(line.to_string())))
}

pub fn render_message(message: &ChatMessage) -> String {
    match &message.sender {
        Sender::Local => format!("me: {}", message.body),
        Sender::Peer(p) => format!("{}: {}", p.display_name, message.body),
    }
}

pub fn render(event: &MeshEvent) -> String {
    match event {
        MeshEvent::PeerFound(p) => format!("* {p} is nearby"),
        MeshEvent::PeerLost(p) => format!("* {p} is gone"),
        MeshEvent::AdvertisingFailed { reason } => format!("! cannot be visible: {reason}"),
        MeshEvent::BrowsingFailed { reason } => format!("! cannot look for devices: {reason}"),
        MeshEvent::InvitationReceived { from } => format!(
            "* {} wants to chat with you (/accept or /decline)",
            from.display_name
        ),
        MeshEvent::InvitationDeclined(p) => format!("* {} declined", p.display_name),
        MeshEvent::InvitationTimedOut(p) => format!("* {} did not answer", p.display_name),
        MeshEvent::InvitationFailed(p) => format!("* could not connect to {}", p.display_name),
        MeshEvent::Connected(p) => format!("* connected to {}", p.display_name),
        MeshEvent::ConnectionLost(p) => {
            format!("* Connection to {} has been lost", p.display_name)
        }
        MeshEvent::MessageReceived { message, .. } => render_message(message),
        MeshEvent::ChatEnded { from } => format!("* {} ended the chat", from.display_name),
    }
}

/// Read commands from stdin and print events until /quit or end of input.
pub async fn run_console(
    node: Node,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type /help for commands");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(cmd) = parse(&line) else { continue };
                if cmd == Command::Quit {
                    break;
                }
                execute(&node, cmd).await;
            }
            Some(event) = events.recv() => {
                println!("{}", render(&event));
                if matches!(event, MeshEvent::ChatEnded { .. }) {
                    node.disconnect().await;
                }
            }
        }
    }
    node.disconnect().await;
    node.stop_advertising().await;
    Ok(())
}

async fn execute(node: &Node, cmd: Command) {
    match cmd {
        Command::Peers => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("no devices nearby");
            }
            for (i, p) in peers.iter().enumerate() {
                println!("{:>3}. {} [{:?}]", i + 1, p, node.connection_state(&p.id).await);
            }
        }
        Command::Invite(n) => {
            let peers = node.peers().await;
            match peers.get(n - 1) {
                Some(p) => match node.invite(p.id).await {
                    Ok(()) => println!("* inviting {}", p.display_name),
                    Err(e) => println!("! {e}"),
                },
                None => println!("! no device {n}; try /peers"),
            }
        }
        Command::Accept | Command::Decline => {
            if let Err(e) = node.respond_to_invitation(cmd == Command::Accept).await {
                println!("! {e}");
            }
        }
        Command::End => {
            if let Err(e) = node.end_chat().await {
                println!("! {e}");
            }
        }
        Command::Leave => node.disconnect().await,
        Command::Visible(true) => node.start_advertising().await,
        Command::Visible(false) => node.stop_advertising().await,
        Command::Browse(true) => node.start_browsing().await,
        Command::Browse(false) => node.stop_browsing().await,
        Command::Status => {
            let visible = if node.is_advertising().await { "on" } else { "off" };
            println!("visible: {visible}");
            let connected = node.connected_peers().await;
            if connected.is_empty() {
                println!("not in a chat");
            }
            for p in connected {
                println!("chatting with {p}");
            }
        }
        Command::Transcript => {
            for m in node.transcript().await {
                println!("{}", render_message(&m));
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
        Command::Say(text) => {
            if let Err(e) = node.send(&text).await {
                println!("! not sent: {e}");
            }
        }
        Command::Unknown(line) => println!("! unknown command {line:?}; try /help"),
    }
}
