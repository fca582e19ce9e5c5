use clap::{ArgAction, Parser};
use std::fmt;
use std::io::{self, Write as _};
use tactoe_server::logger::Logger;
use tactoe_server::protocol::{self, Clock, Header, PacketType, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name    = "client",
    version,
    about   = "Tic-Tac-Toe network game — terminal client",
    long_about = "Connects to a running Tic-Tac-Toe server and plays interactively.\n\
                  Type `help` once connected for the command list."
)]
struct Args {
    /// Server address to connect to
    #[arg(default_value = "127.0.0.1:7878")]
    addr: String,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

// ── CLIENT EVENTS (operational logging to stderr) ─────────────────────────────

enum ClientEvent<'a> {
    Connecting { addr: &'a str },
    Connected { addr: &'a str },
    Sending { ptype: PacketType },
    Received { ptype: PacketType },
    Disconnected,
}

impl fmt::Display for ClientEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Connecting { addr } => write!(f, "Connecting to {addr}…"),
            ClientEvent::Connected { addr } => write!(f, "Connected to {addr}"),
            ClientEvent::Sending { ptype } => write!(f, "→ {ptype:?}"),
            ClientEvent::Received { ptype } => write!(f, "← {ptype:?}"),
            ClientEvent::Disconnected => write!(f, "Connection closed by server"),
        }
    }
}

// ── ROLE TEXT ─────────────────────────────────────────────────────────────────

fn role_letter(role: Role) -> &'static str {
    match role {
        Role::None => "-",
        Role::First => "X",
        Role::Second => "O",
    }
}

fn parse_role(s: &str) -> Option<Role> {
    match s.to_ascii_uppercase().as_str() {
        "X" | "1" | "FIRST" => Some(Role::First),
        "O" | "2" | "SECOND" => Some(Role::Second),
        _ => None,
    }
}

// ── USER INPUT ────────────────────────────────────────────────────────────────

/// A request typed by the player, ready to become one outbound packet.
enum Cmd {
    Login { name: String },
    Users,
    Invite { name: String, target_role: Role },
    Revoke { id: u8 },
    Decline { id: u8 },
    Accept { id: u8 },
    Move { id: u8, mv: String },
    Resign { id: u8 },
}

impl Cmd {
    fn parse(raw: &str) -> Result<Self, String> {
        let mut t = raw.split_whitespace();
        match t.next().unwrap_or("").to_ascii_lowercase().as_str() {
            "login" => {
                let name = t.next().ok_or("usage: login <name>")?;
                Ok(Self::Login { name: name.to_string() })
            }
            "users" => Ok(Self::Users),
            "invite" => {
                let name = t.next().ok_or("usage: invite <name> <X|O>")?;
                let role = t
                    .next()
                    .ok_or("usage: invite <name> <X|O>")
                    .and_then(|r| parse_role(r).ok_or("role must be X or O"))?;
                Ok(Self::Invite { name: name.to_string(), target_role: role })
            }
            "revoke" => Ok(Self::Revoke { id: parse_id(&mut t)? }),
            "decline" => Ok(Self::Decline { id: parse_id(&mut t)? }),
            "accept" => Ok(Self::Accept { id: parse_id(&mut t)? }),
            "resign" => Ok(Self::Resign { id: parse_id(&mut t)? }),
            "move" => {
                let id = parse_id(&mut t)?;
                let mv = t.next().ok_or("usage: move <id> <cell|cell-X|cell-O>")?;
                Ok(Self::Move { id, mv: mv.to_string() })
            }
            "" => Err("empty input".into()),
            kw => Err(format!("unknown command '{kw}'")),
        }
    }

    /// Packet type, id, role, and payload for this request.
    fn to_wire(&self) -> (PacketType, u8, Role, Vec<u8>) {
        match self {
            Self::Login { name } => (PacketType::Login, 0, Role::None, name.clone().into_bytes()),
            Self::Users => (PacketType::Users, 0, Role::None, Vec::new()),
            Self::Invite { name, target_role } => {
                (PacketType::Invite, 0, *target_role, name.clone().into_bytes())
            }
            Self::Revoke { id } => (PacketType::Revoke, *id, Role::None, Vec::new()),
            Self::Decline { id } => (PacketType::Decline, *id, Role::None, Vec::new()),
            Self::Accept { id } => (PacketType::Accept, *id, Role::None, Vec::new()),
            Self::Move { id, mv } => (PacketType::Move, *id, Role::None, mv.clone().into_bytes()),
            Self::Resign { id } => (PacketType::Resign, *id, Role::None, Vec::new()),
        }
    }
}

fn parse_id<'a>(t: &mut impl Iterator<Item = &'a str>) -> Result<u8, String> {
    t.next()
        .ok_or("missing invitation id")?
        .parse::<u8>()
        .map_err(|_| "invitation id must be 0-255".to_string())
}

// ── INCOMING PACKET DISPLAY ───────────────────────────────────────────────────

fn describe(header: &Header, payload: &Option<Vec<u8>>) -> String {
    let text = || {
        payload
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    };
    match header.ptype {
        PacketType::Ack => {
            let body = text();
            if body.is_empty() {
                "OK".to_string()
            } else {
                format!("OK\n{body}")
            }
        }
        PacketType::Nack => format!("Rejected (id={})", header.id),
        PacketType::Invited => format!(
            "Invitation #{} from {:?} — you would play as {}",
            header.id,
            text(),
            role_letter(header.role)
        ),
        PacketType::Revoked => format!("Invitation #{} was revoked", header.id),
        PacketType::Declined => format!("Invitation #{} was declined", header.id),
        PacketType::Accepted => {
            let body = text();
            if body.is_empty() {
                format!("Invitation #{} accepted, opponent moves first", header.id)
            } else {
                format!("Invitation #{} accepted\n{body}", header.id)
            }
        }
        PacketType::Moved => format!("Game #{} updated\n{}", header.id, text()),
        PacketType::Resigned => format!("Opponent resigned game #{}", header.id),
        PacketType::Ended => format!(
            "Game #{} over — winner: {}",
            header.id,
            role_letter(header.role)
        ),
        other => format!("(unexpected packet {other:?})"),
    }
}

fn print_prompt() {
    print!("\n> ");
    io::stdout().flush().ok();
}

fn print_help() {
    println!("  Commands:");
    println!("    login <name>                 — log in under <name>");
    println!("    users                         — list logged-in players and ratings");
    println!("    invite <name> <X|O>           — invite <name> to play as X or O");
    println!("    accept <id>                   — accept invitation <id>");
    println!("    decline <id>                  — decline invitation <id>");
    println!("    revoke <id>                   — revoke an invitation you sent");
    println!("    move <id> <cell[-X|-O]>       — play a move, e.g. `move 0 5`");
    println!("    resign <id>                   — resign game <id>");
    println!("    help                          — show this text");
    println!("    quit                          — disconnect");
}

// ── MAIN ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log = Logger::new(args.verbose);

    log.info(ClientEvent::Connecting { addr: &args.addr });

    let stream = match TcpStream::connect(&args.addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect to {}: {e}", args.addr);
            std::process::exit(1);
        }
    };

    log.info(ClientEvent::Connected { addr: &args.addr });

    let (mut reader, mut writer) = stream.into_split();
    let clock = Clock::new();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();

    print_help();
    print_prompt();

    loop {
        tokio::select! {
            // ── Server → Client ───────────────────────────────────────────────
            received = protocol::recv(&mut reader) => {
                let (header, payload) = match received {
                    Ok(v) => v,
                    Err(_) => {
                        log.info(ClientEvent::Disconnected);
                        println!("\nDisconnected from server.");
                        break;
                    }
                };
                log.trace(ClientEvent::Received { ptype: header.ptype });
                println!("\n{}", describe(&header, &payload));
                print_prompt();
            }

            // ── Stdin → Server ─────────────────────────────────────────────────
            line = stdin_lines.next_line() => {
                let raw = match line {
                    Ok(Some(l)) => l,
                    _ => {
                        println!("\nInput closed.");
                        break;
                    }
                };

                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    print_prompt();
                    continue;
                }
                if matches!(trimmed.to_ascii_lowercase().as_str(), "help" | "?") {
                    print_help();
                    print_prompt();
                    continue;
                }
                if trimmed.eq_ignore_ascii_case("quit") {
                    break;
                }

                match Cmd::parse(trimmed) {
                    Ok(cmd) => {
                        let (ptype, id, role, payload) = cmd.to_wire();
                        let header = Header::new(ptype, id, role, payload.len() as u16);
                        log.verbose(ClientEvent::Sending { ptype });
                        if protocol::send(&mut writer, header, &payload, &clock).await.is_err() {
                            eprintln!("Failed to send command.");
                            break;
                        }
                    }
                    Err(reason) => {
                        println!("  ? {reason}");
                    }
                }
                print_prompt();
            }
        }
    }
}
