// Command-line tic-tac-toe client
//
// Usage: tictactoe-net [--debug] <mode>
//   --host [port]            host a LAN game
//   --join <address> [port]  join a LAN game
//   --create-room            create an internet room
//   --join-room <code>       join an internet room
//   --offline [3|4|5]        hot-seat game on this device (default)

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use tictactoe_net::config::{self, Config};
use tictactoe_net::debug;
use tictactoe_net::game::{BoardSize, Mark};
use tictactoe_net::network::{
    discover_local_ip, Capabilities, RelayBackend, TransportEvent,
};
use tictactoe_net::session::{GameMode, SessionController};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Host(Option<u16>),
    Join(String, Option<u16>),
    CreateRoom,
    JoinRoom(String),
    Offline(BoardSize),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (mode, debug_enabled) = parse_args(&args)?;

    debug::init(debug_enabled).context("failed to set up logging")?;
    info!("Starting in {:?}", mode);

    let config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    // Only reach for the relay server when the mode needs it
    let capabilities = match mode {
        Mode::CreateRoom | Mode::JoinRoom(_) => Capabilities::resolve(&config).await,
        _ => Capabilities {
            tcp: config.local.enabled,
            relay: RelayBackend::Unavailable {
                reason: "not requested".to_string(),
            },
        },
    };

    let mut session = SessionController::new(&config, capabilities);

    match &mode {
        Mode::Host(port) => {
            let port = session.host_local(*port).await?;
            println!("Hosting on {}:{}", discover_local_ip(), port);
            println!("Waiting for an opponent to join...");
        }
        Mode::Join(address, port) => {
            session.join_local(address, *port).await?;
        }
        Mode::CreateRoom => {
            if let Some(reason) = session.relay().unavailable_reason() {
                bail!("internet play is not available: {}", reason);
            }
            let code = session.create_room().await?;
            println!("Room code: {}", code);
            println!("Share it with your opponent. Waiting for them to join...");
        }
        Mode::JoinRoom(code) => {
            if let Some(reason) = session.relay().unavailable_reason() {
                bail!("internet play is not available: {}", reason);
            }
            session.join_room(code).await?;
        }
        Mode::Offline(size) => {
            session.set_mode(GameMode::Offline(*size)).await;
            render(&session);
        }
    }

    run(&mut session).await;
    session.leave().await;
    Ok(())
}

async fn run(session: &mut SessionController) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        return;
                    }
                };
                if !handle_command(session, line.trim()).await {
                    return;
                }
            }
            event = session.next_event() => {
                let Some(event) = event else {
                    return;
                };
                if !report(session, &event) {
                    return;
                }
            }
        }
    }
}

/// Returns false when the player wants out
async fn handle_command(session: &mut SessionController, command: &str) -> bool {
    match command {
        "" => {}
        "q" | "quit" => return false,
        "r" | "reset" => {
            session.reset(Mark::X).await;
            render(session);
        }
        "h" | "help" => print_commands(),
        cell => match cell.parse::<usize>() {
            Ok(n) if n >= 1 && n <= session.game().board.len() => {
                if session.play(n - 1).await {
                    render(session);
                } else if session.game().is_over() {
                    println!("The game is over. Type r to play again.");
                } else {
                    println!("You can't play there right now.");
                }
            }
            _ => println!("Unknown command \"{}\". Type h for help.", cell),
        },
    }
    true
}

/// Print what an event means to the player. Returns false once the session is over.
fn report(session: &SessionController, event: &TransportEvent) -> bool {
    match event {
        TransportEvent::Hosting { .. } | TransportEvent::RoomCreated { .. } => {}
        TransportEvent::Connected { role } => {
            println!("Opponent connected. You are {}.", role.mark());
            render(session);
        }
        TransportEvent::Move(_) | TransportEvent::Reset { .. } => render(session),
        TransportEvent::Sync(sync) if !sync.provisional => render(session),
        TransportEvent::Sync(_) | TransportEvent::Turn { .. } => {}
        TransportEvent::PeerLeft => {
            println!("Your opponent left. The room is open for someone else to join.");
        }
        TransportEvent::Error(e) => {
            eprintln!("Error: {}", e);
        }
        TransportEvent::Disconnected => {
            println!("Disconnected.");
            return false;
        }
    }
    true
}

fn render(session: &SessionController) {
    let game = session.game();
    println!();
    println!("{}", game.board);

    if let Some(winner) = game.winner {
        match session.my_mark() {
            Some(mine) if mine == winner => println!("You win!"),
            Some(_) => println!("You lose."),
            None => println!("{} wins!", winner),
        }
    } else if game.is_draw {
        println!("It's a draw.");
    } else if session.my_mark().is_none() {
        println!("{} to move", game.current_player);
    } else if session.is_my_turn() {
        println!("Your turn ({})", game.current_player);
    } else {
        println!("Waiting for {}...", game.current_player);
    }
}

/// Parse command line arguments into a mode and the debug flag
fn parse_args(args: &[String]) -> anyhow::Result<(Mode, bool)> {
    let program = args.first().map(String::as_str).unwrap_or("tictactoe-net");
    let mut rest: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();

    let debug_enabled = rest.contains(&"--debug");
    rest.retain(|arg| *arg != "--debug");

    let port = |arg: Option<&&str>| -> anyhow::Result<Option<u16>> {
        arg.map(|p| p.parse::<u16>().with_context(|| format!("invalid port \"{}\"", p)))
            .transpose()
    };

    let mode = match rest.first().copied() {
        None | Some("--offline") => {
            let size = match rest.get(1).copied() {
                None | Some("3") => BoardSize::Three,
                Some("4") => BoardSize::Four,
                Some("5") => BoardSize::Five,
                Some(other) => bail!("board size must be 3, 4 or 5, not \"{}\"", other),
            };
            Mode::Offline(size)
        }
        Some("--host") => Mode::Host(port(rest.get(1))?),
        Some("--join") => {
            let Some(address) = rest.get(1) else {
                print_usage(program);
                bail!("--join requires an address");
            };
            Mode::Join(address.to_string(), port(rest.get(2))?)
        }
        Some("--create-room") => Mode::CreateRoom,
        Some("--join-room") => {
            let Some(code) = rest.get(1) else {
                print_usage(program);
                bail!("--join-room requires a room code");
            };
            Mode::JoinRoom(code.to_string())
        }
        Some("--help") | Some("-h") => {
            print_usage(program);
            std::process::exit(0);
        }
        Some(other) => {
            print_usage(program);
            bail!("unknown argument \"{}\"", other);
        }
    };

    Ok((mode, debug_enabled))
}

fn print_usage(program: &str) {
    println!("Tic-tac-toe over LAN or the internet");
    println!();
    println!("Usage:");
    println!("  {} [--offline [3|4|5]]        # Hot-seat game on this device", program);
    println!("  {} --host [port]              # Host a LAN game", program);
    println!("  {} --join <address> [port]    # Join a LAN game", program);
    println!("  {} --create-room              # Create an internet room", program);
    println!("  {} --join-room <code>         # Join an internet room", program);
    println!();
    println!("Options:");
    println!("  --debug   Write a debug log to {}", debug::LOG_FILE_PATH);
    println!();
    print_commands();
}

fn print_commands() {
    println!("While playing:");
    println!("  1-9   Place your mark (cells numbered left to right, top to bottom)");
    println!("  r     Start a new game");
    println!("  q     Quit");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tictactoe-net")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(parse_args(&args(&[])).unwrap(), (Mode::Offline(BoardSize::Three), false));
        assert_eq!(
            parse_args(&args(&["--host", "9999", "--debug"])).unwrap(),
            (Mode::Host(Some(9999)), true)
        );
        assert_eq!(
            parse_args(&args(&["--join", "192.168.1.20"])).unwrap(),
            (Mode::Join("192.168.1.20".into(), None), false)
        );
        assert_eq!(
            parse_args(&args(&["--join-room", "ab12c3"])).unwrap(),
            (Mode::JoinRoom("ab12c3".into()), false)
        );
        assert_eq!(
            parse_args(&args(&["--offline", "5"])).unwrap(),
            (Mode::Offline(BoardSize::Five), false)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_args(&args(&["--host", "notaport"])).is_err());
        assert!(parse_args(&args(&["--offline", "7"])).is_err());
        assert!(parse_args(&args(&["--join"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }
}
