//! estimo: planning poker from the terminal.
//!
//! `estimo serve` runs the relay; `estimo join [ROOM]` takes a seat in a
//! room. The profile directory plays the part of a browser's storage: every
//! `join` pointed at the same directory shares one identity, and a rename
//! in one terminal reaches the others within [`PROFILE_POLL`].

mod config;
mod input;
mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

use estimo_collab::client::ClientConfig;
use estimo_collab::participant::{Participant, ParticipantUpdate};
use estimo_collab::server::RelayServer;
use estimo_core::{names, BrowserContext, FileMedium};

use config::Config;
use input::Input;

/// How often the profile directory is checked for other processes' writes.
const PROFILE_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "estimo", version, about = "Planning poker rooms from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay.
    Serve {
        /// Address to listen on.
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
        /// Seats per room.
        #[arg(long, value_name = "N")]
        max_peers: Option<usize>,
        /// Messages buffered per room before slow peers drop some.
        #[arg(long, value_name = "N")]
        broadcast_capacity: Option<usize>,
    },
    /// Join a room, creating it if nobody is there yet.
    Join {
        /// Room id; a fresh one is generated when omitted.
        room: Option<String>,
        /// Relay URL.
        #[arg(long, value_name = "URL")]
        server: Option<String>,
        /// Profile directory holding the identity.
        #[arg(long, value_name = "DIR")]
        profile: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::default();
    config::apply_env_overrides(&mut config);

    match cli.command {
        Command::Serve {
            bind,
            max_peers,
            broadcast_capacity,
        } => {
            if let Some(bind) = bind {
                config.relay.bind_addr = bind;
            }
            if let Some(n) = max_peers {
                config.relay.max_peers_per_room = n.max(1);
            }
            if let Some(n) = broadcast_capacity {
                config.relay.broadcast_capacity = n.max(1);
            }
            serve(config).await
        }
        Command::Join { room, server, profile } => {
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(profile) = profile {
                config.profile_dir = profile;
            }
            let room = room.unwrap_or_else(names::generate_room_id);
            join(config, room).await
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting relay: {} peers per room, broadcast capacity {}",
        config.relay.max_peers_per_room, config.relay.broadcast_capacity
    );
    RelayServer::new(config.relay).run().await
}

async fn join(config: Config, room: String) -> Result<(), Box<dyn std::error::Error>> {
    let medium = FileMedium::open(&config.profile_dir)?;
    let browser = BrowserContext::new(Arc::new(medium));
    let profile_watch = browser.watch_external(PROFILE_POLL)?;
    let client_config = ClientConfig {
        server_url: config.server_url.clone(),
        ..ClientConfig::default()
    };

    let mut participant = Participant::open_in(&browser, &room, client_config)?;
    participant.connect().await?;
    println!("Joined room {room} as {}", participant.presence().username);
    println!("{}", input::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_input(&mut participant, &room, Input::parse(&line)).await {
                    break;
                }
            }
            update = participant.next_update() => {
                let Some(update) = update else {
                    break;
                };
                match update {
                    ParticipantUpdate::Rejected(reason) => {
                        eprintln!("The relay turned us away: {reason}");
                        break;
                    }
                    ParticipantUpdate::Disconnected => {
                        eprintln!("Lost the connection to {}", config.server_url);
                        break;
                    }
                    ParticipantUpdate::Celebration(c) => {
                        print!("{}", render::table(&room, &participant.table()));
                        println!("{}", render::celebration(&c));
                    }
                    ParticipantUpdate::Identity => {
                        println!("You are now {}", participant.presence().username);
                    }
                    ParticipantUpdate::Connected | ParticipantUpdate::Table => {
                        print!("{}", render::table(&room, &participant.table()));
                    }
                }
            }
        }
    }

    participant.disconnect().await;
    profile_watch.abort();
    Ok(())
}

/// Returns false when the user wants to leave.
async fn handle_input(participant: &mut Participant, room: &str, command: Input) -> bool {
    let result = match command {
        Input::Quit => return false,
        Input::Empty => return true,
        Input::Help => {
            println!("{}", input::HELP);
            return true;
        }
        Input::Vote(label) => participant.submit_estimate(&label).await,
        Input::Reveal => participant.toggle_reveal().await,
        Input::NewRound => participant.clear_all().await,
        Input::Spectate => participant.toggle_spectator().await,
        Input::Rename(name) => participant.rename(&name).await.map(|()| None),
    };

    match result {
        Ok(celebration) => {
            print!("{}", render::table(room, &participant.table()));
            if let Some(c) = celebration {
                println!("{}", render::celebration(&c));
            }
        }
        Err(e) => eprintln!("{e}"),
    }
    true
}
