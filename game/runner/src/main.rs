//! The server binary: configuration and logger bootstrap, and the event
//! loop tying together the endpoint (transport), the game (authority), the
//! dispatcher and the timer service.

use bosun::logging;
use bosun::timer::{TimerId, Timers};
use clap::Parser;
use gamecore::config::GameConfig;
use gamecore::game::{Effect, Game};
use semaphore::endpoint::{ConnectionChange, Endpoint};
use semaphore::shared::ClientId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GAME_CFG_NAME: &str = "game_config.toml";
const LOG_CFG_NAME: &str = "broadside.log.toml";

#[derive(Parser)]
#[command(name = "broadside", about = "Networked two-player Battleship server with spectators")]
struct Opts {
    /// Path to the game configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured bind address (<host>:<port>).
    #[arg(long, value_name = "ADDR")]
    address: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TimerEvent {
    /// A player sent nothing for the whole idle window.
    IdleTimeout(ClientId),
    /// The reconnect grace window ran out.
    GraceExpired,
}

fn main() {
    let opts = Opts::parse();

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let config = match &opts.config {
        Some(path) => GameConfig::load(path),
        None => match exe_dir.as_ref().map(|dir| dir.join(GAME_CFG_NAME)) {
            Some(path) if path.is_file() => GameConfig::load(path),
            _ => GameConfig::default(),
        },
    };

    let log_config = exe_dir
        .as_ref()
        .map(|dir| dir.join(LOG_CFG_NAME))
        .unwrap_or_else(|| PathBuf::from(LOG_CFG_NAME));
    let log = logging::init(log_config);

    let address = opts.address.unwrap_or_else(|| config.server.address.clone());

    logging::info!(log, "server starting";
                   "address" => &address,
                   "max_clients" => config.server.max_clients,
                   "started_at" => bosun::time::timestamp_secs());

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .expect("Error installing the shutdown handler");
    }

    let mut endpoint = Endpoint::new(
        &address,
        config.server.max_clients as usize,
        config.protocol.retransmit(),
        &log,
    )
    .expect("Failed creating the server endpoint");

    let mut game = Game::new(config.game.cooldown(), &log);
    let mut timers: Timers<TimerEvent> = Timers::new();
    let mut idle_timers: HashMap<ClientId, TimerId> = HashMap::new();
    let mut grace_timer: Option<TimerId> = None;

    let tick = config.game.tick();
    let idle_timeout = config.game.idle_timeout();
    let grace = config.game.reconnect_grace();

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();

        endpoint.sync(now, tick);

        let changes: Vec<ConnectionChange> = endpoint.changes().collect();
        for change in changes {
            match change {
                ConnectionChange::Connected(id) => game.on_client_connected(id),
                ConnectionChange::Disconnected(id) => {
                    if let Some(timer) = idle_timers.remove(&id) {
                        timers.cancel(timer);
                    }
                    game.on_client_disconnected(id, now);
                }
            }
        }

        for (id, frame) in endpoint.take_inbound() {
            // Any frame from a player rearms its idle timer.
            if game.is_player(id) {
                if let Some(timer) = idle_timers.remove(&id) {
                    timers.cancel(timer);
                }
                idle_timers.insert(id, timers.schedule(now + idle_timeout, TimerEvent::IdleTimeout(id)));
            }

            game.dispatch(id, &frame, now);
        }

        game.tick(now);
        apply_effects(&mut game, &mut endpoint, &mut timers, &mut grace_timer, grace, now);

        // Clients gain and lose the player role through promotion,
        // reconnect and match end, not only through traffic; keep the idle
        // timers matched to the current role assignment.
        reconcile_idle_timers(&game, &mut timers, &mut idle_timers, idle_timeout, now);

        for event in timers.poll_expired(now) {
            match event {
                TimerEvent::IdleTimeout(id) => {
                    logging::info!(log, "player idle timeout"; "client_id" => id);
                    idle_timers.remove(&id);
                    endpoint.close(id, true, now);
                }
                TimerEvent::GraceExpired => {
                    grace_timer = None;
                    game.on_grace_expired(now);
                }
            }
        }
        apply_effects(&mut game, &mut endpoint, &mut timers, &mut grace_timer, grace, now);
    }

    logging::info!(log, "shutting down");
    endpoint.close_all(true, Instant::now());
}

/// Applies everything the game asked for: outbound frames, timer control
/// and connection teardown.
fn apply_effects(
    game: &mut Game,
    endpoint: &mut Endpoint,
    timers: &mut Timers<TimerEvent>,
    grace_timer: &mut Option<TimerId>,
    grace: Duration,
    now: Instant,
) {
    for effect in game.take_effects() {
        match effect {
            Effect::Send { to, kind, expected, text } => endpoint.send(to, kind, expected, &text, now),
            Effect::ArmGraceTimer => {
                if grace_timer.is_none() {
                    *grace_timer = Some(timers.schedule(now + grace, TimerEvent::GraceExpired));
                }
            }
            Effect::CancelGraceTimer => {
                if let Some(timer) = grace_timer.take() {
                    timers.cancel(timer);
                }
            }
            Effect::Close(id) => endpoint.close(id, true, now),
            Effect::CloseAll => endpoint.close_all(true, now),
        }
    }
}

/// Arms an idle timer for every player that lacks one and disarms timers
/// held by clients no longer bound to a slot.
fn reconcile_idle_timers(
    game: &Game,
    timers: &mut Timers<TimerEvent>,
    idle_timers: &mut HashMap<ClientId, TimerId>,
    idle_timeout: Duration,
    now: Instant,
) {
    let players = game.player_client_ids();

    for &id in &players {
        idle_timers
            .entry(id)
            .or_insert_with(|| timers.schedule(now + idle_timeout, TimerEvent::IdleTimeout(id)));
    }

    let demoted: Vec<ClientId> = idle_timers
        .keys()
        .copied()
        .filter(|id| !players.contains(id))
        .collect();

    for id in demoted {
        if let Some(timer) = idle_timers.remove(&id) {
            timers.cancel(timer);
        }
    }
}
