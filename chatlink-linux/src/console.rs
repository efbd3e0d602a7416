//! Line-oriented UI on stdin/stdout: typed lines become chat messages, `/` lines are commands.

use std::path::PathBuf;

use chatlink_core::{SessionEvent, SessionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::SessionController;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Connect(String),
    SendFile(PathBuf),
    Server(bool),
    Start,
    Stop,
    Peers,
    Kick(String),
    History,
    Status,
    Quit,
    Help,
    Invalid(String),
}

const HELP: &str = "commands: /connect <host:port>  /file <path>  /server on|off  /start  /stop  /peers  /kick <addr>  /history  /status  /quit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    if line.trim().is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    let parsed = match (cmd, arg) {
        ("connect", a) if !a.is_empty() => Command::Connect(a.to_string()),
        ("file", a) if !a.is_empty() => Command::SendFile(PathBuf::from(a)),
        ("server", "on") => Command::Server(true),
        ("server", "off") => Command::Server(false),
        ("start", "") => Command::Start,
        ("stop", "") => Command::Stop,
        ("peers", "") => Command::Peers,
        ("kick", a) if !a.is_empty() => Command::Kick(a.to_string()),
        ("history", "") => Command::History,
        ("status", "") => Command::Status,
        ("quit", "") | ("exit", "") => Command::Quit,
        ("help", _) => Command::Help,
        _ => Command::Invalid(line.to_string()),
    };
    Some(parsed)
}

/// Human-readable line for a session event.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StateChanged(state) => Some(match state {
            SessionState::None => "* not connected".to_string(),
            SessionState::Listening => "* waiting for peers".to_string(),
            SessionState::Connecting => "* connecting...".to_string(),
            SessionState::Connected => "* connected".to_string(),
        }),
        SessionEvent::DeviceConnected(name) => Some(format!("* {} joined", name)),
        SessionEvent::Toast(text) => Some(format!("! {}", text)),
        SessionEvent::MessageReceived(msg) => {
            Some(format!("[{}] {}: {}", msg.timestamp, msg.author, msg.text))
        }
        SessionEvent::OutboundEcho(_) => None,
    }
}

/// Print session events until the channel closes.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = render_event(&event) {
            println!("{}", line);
        }
    }
}

/// Read stdin and drive the controller. Returns on `/quit` or end of input.
pub async fn run<T: Transport>(controller: SessionController<T>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(cmd) = parse_command(&line) else {
            continue;
        };
        debug!(?cmd, "console command");
        match cmd {
            Command::Say(text) => controller.send_message(&text).await,
            Command::Connect(target) => controller.connect_to(&target).await,
            Command::SendFile(path) => controller.send_file(&path).await,
            Command::Server(on) => controller.set_server(on).await,
            Command::Start => controller.start().await,
            Command::Stop => controller.stop().await,
            Command::Peers => {
                let peers = controller.peers().await;
                if peers.is_empty() {
                    println!("* no peers");
                }
                for (address, name) in peers {
                    println!("* {} ({})", name, address);
                }
            }
            Command::Kick(address) => {
                if !controller.disconnect_peer(&address).await {
                    println!("* no peer at {}", address);
                }
            }
            Command::History => {
                for msg in controller.history().await {
                    println!("  [{}] {}: {}", msg.timestamp, msg.author, msg.text);
                }
            }
            Command::Status => {
                let role = if controller.is_server().await { "server" } else { "client" };
                println!("* {} ({})", controller.state().await, role);
            }
            Command::Quit => break,
            Command::Help => println!("{}", HELP),
            Command::Invalid(line) => println!("unknown command: {}\n{}", line, HELP),
        }
    }
    Ok(())
}
