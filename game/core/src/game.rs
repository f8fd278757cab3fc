//! The authoritative match state machine.
//!
//! One `Game` instance drives every connected client through the match
//! phases (WAIT, PLACE, BATTLE, END, with PAUSE as a superposition while a
//! player is disconnected mid-match). State changes happen through the
//! operations here and in the dispatcher; everything the outside world
//! should do in response is pushed onto an effect queue that the runner
//! drains after each call.

use crate::board::{parse_coordinate, Board, FireOutcome, Orientation, SHIPS};
use bosun::logging;
use indexmap::IndexMap;
use rand::Rng;
use semaphore::frame::MessageKind;
use semaphore::shared::ClientId;
use std::time::{Duration, Instant};

pub const SHIPS_PER_PLAYER: usize = SHIPS.len();
pub const PLAYER_COUNT: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GameState {
    Wait,
    Place,
    Battle,
    End,
    Pause,
}

/// Requested side effects, drained by the runner after every operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Effect {
    Send {
        to: ClientId,
        kind: MessageKind,
        expected: MessageKind,
        text: String,
    },
    /// Start the reconnect grace window.
    ArmGraceTimer,
    /// The missing player returned (or the match ended); stop the window.
    CancelGraceTimer,
    /// Disconnect one peer.
    Close(ClientId),
    /// Disconnect everyone (forfeit, shutdown).
    CloseAll,
}

/// One player slot; the slot number is the index in `Game::players`.
pub struct Player {
    pub(crate) board: Board,
    pub(crate) ships_placed: usize,
    pub(crate) orientation: Orientation,
    pub(crate) moves: u32,
    pub(crate) client: Option<ClientId>,
}

impl Player {
    fn new() -> Player {
        Player {
            board: Board::new(),
            ships_placed: 0,
            orientation: Orientation::Horizontal,
            moves: 0,
            client: None,
        }
    }
}

pub(crate) struct ClientInfo {
    pub(crate) username: String,
}

struct DisconnectedPlayer {
    slot: usize,
    username: String,
}

pub struct Game {
    pub(crate) state: GameState,
    pub(crate) previous_state: GameState,
    pub(crate) players: [Player; PLAYER_COUNT],
    pub(crate) turn: Option<usize>,
    disconnected: Option<DisconnectedPlayer>,
    /// Counts finished matches; rotates who plays next.
    game_number: usize,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
    /// Connected clients in accept order. The order feeds the rotation.
    pub(crate) roster: IndexMap<ClientId, ClientInfo>,
    effects: Vec<Effect>,
    log: logging::Logger,
}

impl Game {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(cooldown: Duration, log: L) -> Game {
        let game_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Game {
            state: GameState::Wait,
            previous_state: GameState::Wait,
            players: [Player::new(), Player::new()],
            turn: None,
            disconnected: None,
            game_number: 0,
            cooldown,
            cooldown_until: None,
            roster: IndexMap::new(),
            effects: Vec::new(),
            log: game_log,
        }
    }

    #[inline]
    pub fn state(&self) -> GameState {
        self.state
    }

    /// Drains the side effects requested since the last call.
    #[inline]
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    #[inline]
    pub fn is_player(&self, id: ClientId) -> bool {
        self.player_slot(id).is_some()
    }

    /// Client ids currently bound to a player slot.
    pub fn player_client_ids(&self) -> Vec<ClientId> {
        self.players.iter().filter_map(|player| player.client).collect()
    }

    pub(crate) fn player_slot(&self, id: ClientId) -> Option<usize> {
        self.players.iter().position(|player| player.client == Some(id))
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// A new peer was accepted: enter it into the roster as a spectator,
    /// assign its id on the wire and tell it where the match stands.
    pub fn on_client_connected(&mut self, id: ClientId) {
        self.roster.insert(id, ClientInfo { username: String::new() });

        logging::info!(self.log, "client joined";
                       "client_id" => id,
                       "clients" => self.roster.len(),
                       "state" => ?self.state);

        self.send(id, MessageKind::Connect, MessageKind::Chat, id.to_string());

        match self.state {
            GameState::Wait => self.send_waiting_message(id),
            GameState::Place | GameState::Battle => self.text(id, "YOU ARE CURRENTLY SPECTATING"),
            GameState::Pause => (),
            GameState::End => self.text(id, "WAITING FOR NEW GAME TO START"),
        }
    }

    /// A peer went away. Spectators just leave the roster; losing a player
    /// pauses the match and starts the reconnect grace window.
    pub fn on_client_disconnected(&mut self, id: ClientId, now: Instant) {
        let username = match self.roster.shift_remove(&id) {
            Some(info) => info.username,
            None => return,
        };

        let slot = match self.player_slot(id) {
            Some(slot) => slot,
            None => {
                logging::info!(self.log, "spectator left"; "client_id" => id);
                return;
            }
        };

        self.players[slot].client = None;

        logging::info!(self.log, "player disconnected";
                       "client_id" => id,
                       "slot" => slot,
                       "state" => ?self.state);

        match self.state {
            GameState::Place | GameState::Battle => {
                self.previous_state = self.state;
                self.state = GameState::Pause;
                self.disconnected = Some(DisconnectedPlayer { slot, username });
                self.effects.push(Effect::ArmGraceTimer);
                self.announce_to_players(format!(
                    "[INFO] player [{}] has disconnected, waiting for reconnect",
                    id
                ));
            }
            GameState::Pause => {
                // The other player was already gone; nobody is left to wait
                // for.
                self.disconnected = None;
                self.effects.push(Effect::CancelGraceTimer);
                self.end_abandoned(now);
            }
            GameState::Wait | GameState::End => (),
        }
    }

    /// First CONNECT payload from a peer asserts its identity. A username
    /// matching the disconnected player resumes the paused match.
    pub(crate) fn set_username(&mut self, id: ClientId, username: &str) {
        match self.roster.get_mut(&id) {
            Some(info) if info.username.is_empty() => info.username = username.to_owned(),
            _ => return,
        }

        logging::debug!(self.log, "client identified"; "client_id" => id, "username" => username);

        if self.state == GameState::Pause {
            let slot = match &self.disconnected {
                Some(gone) if !username.is_empty() && gone.username == username => gone.slot,
                _ => return,
            };
            self.reconnect(id, slot);
        }
    }

    fn reconnect(&mut self, id: ClientId, slot: usize) {
        self.players[slot].client = Some(id);
        self.disconnected = None;
        self.state = self.previous_state;
        self.effects.push(Effect::CancelGraceTimer);

        logging::info!(self.log, "player reconnected, resuming";
                       "client_id" => id,
                       "slot" => slot,
                       "state" => ?self.state);

        let username = self.roster[&id].username.clone();
        self.text(id, format!("Welcome back {}, the game will now resume", username));
        self.announce_to_all("Player has reconnected, resuming game");

        match self.state {
            GameState::Battle => {
                for slot in 0..PLAYER_COUNT {
                    self.send_fire_prompt(slot);
                }
            }
            GameState::Place => {
                for slot in 0..PLAYER_COUNT {
                    self.send_place_prompt(slot);
                }
            }
            _ => (),
        }
    }

    /// The reconnect grace window ran out.
    pub fn on_grace_expired(&mut self, now: Instant) {
        if self.state != GameState::Pause {
            return;
        }

        logging::info!(self.log, "reconnect grace expired, ending match");
        self.disconnected = None;
        self.end_abandoned(now);
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Advances the match: starts it once two clients are present, opens
    /// the battle once both fleets are placed, ends it once a fleet is
    /// sunk, and resets after the cool-down.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            GameState::Wait => {
                if self.roster.len() >= PLAYER_COUNT {
                    self.start_match();
                }
            }
            GameState::Place => {
                if self.players.iter().all(|player| player.ships_placed >= SHIPS_PER_PLAYER) {
                    self.start_battle();
                }
            }
            GameState::Battle => {
                if self.players[0].board.all_ships_sunk() {
                    self.finish_match(1, now);
                } else if self.players[1].board.all_ships_sunk() {
                    self.finish_match(0, now);
                }
            }
            GameState::Pause => (),
            GameState::End => {
                if let Some(until) = self.cooldown_until {
                    if now >= until {
                        self.new_game();
                    }
                }
            }
        }
    }

    fn start_match(&mut self) {
        logging::info!(self.log, "match starting";
                       "game_number" => self.game_number,
                       "clients" => self.roster.len());

        self.announce_to_all("GAME STARTING");
        self.state = GameState::Place;

        // Rotate who plays across matches; everyone else spectates.
        let count = self.roster.len();
        let first = (2 * self.game_number) % count;
        let second = (first + 1) % count;

        for (slot, index) in [first, second].iter().enumerate() {
            let id = *self.roster.get_index(*index).expect("roster index in range").0;
            self.players[slot].client = Some(id);
            self.text(id, format!("YOU ARE PLAYER {}", slot));
        }

        self.announce_to_spectators("YOU ARE A SPECTATOR");

        for slot in 0..PLAYER_COUNT {
            self.send_place_prompt(slot);
        }
    }

    fn start_battle(&mut self) {
        self.state = GameState::Battle;

        for id in self.player_client_ids() {
            self.send(id, MessageKind::Text, MessageKind::Fire, "BATTLE STARTING");
        }

        let opening = rand::thread_rng().gen_range(0..PLAYER_COUNT);
        self.turn = Some(opening);

        logging::info!(self.log, "battle starting"; "opening_turn" => opening);

        self.send_fire_prompt(opening);
        if let Some(waiting) = self.players[1 - opening].client {
            self.send(waiting, MessageKind::Text, MessageKind::Fire, "Waiting for opponent...");
        }
    }

    fn finish_match(&mut self, winner: usize, now: Instant) {
        let loser = 1 - winner;

        logging::info!(self.log, "match over";
                       "winner_slot" => winner,
                       "winner_moves" => self.players[winner].moves);

        self.state = GameState::End;
        self.turn = None;
        self.announce_to_players("GAME OVER");

        if let Some(id) = self.players[winner].client {
            self.text(id, "YOU WIN!!!");
            self.text(id, format!("You won in {} moves!", self.players[winner].moves));
        }
        if let Some(id) = self.players[loser].client {
            self.text(id, "You lose");
        }
        self.announce_to_spectators(format!("GAME OVER! PLAYER {} WINS!", winner));

        self.game_number += 1;
        self.cooldown_until = Some(now + self.cooldown);
    }

    /// Ends a match that lost its players (grace expiry, double disconnect).
    fn end_abandoned(&mut self, now: Instant) {
        self.state = GameState::End;
        self.turn = None;
        self.announce_to_all("GAME OVER");

        self.game_number += 1;
        self.cooldown_until = Some(now + self.cooldown);
    }

    fn new_game(&mut self) {
        logging::debug!(self.log, "resetting for the next match"; "game_number" => self.game_number);

        self.players = [Player::new(), Player::new()];
        self.state = GameState::Wait;
        self.previous_state = GameState::Wait;
        self.turn = None;
        self.disconnected = None;
        self.cooldown_until = None;
    }

    // ------------------------------------------------------------------
    // Player commands
    // ------------------------------------------------------------------

    /// One placement attempt. `X` toggles orientation, anything else is a
    /// coordinate for the next ship in the fixed sequence.
    pub(crate) fn place_ship(&mut self, id: ClientId, payload: &str) {
        let slot = match self.player_slot(id) {
            Some(slot) => slot,
            None => return,
        };

        if self.players[slot].ships_placed >= SHIPS_PER_PLAYER {
            self.text(id, "All ships placed. Waiting for opponent...");
            return;
        }

        let coords = payload.trim().to_uppercase();

        if coords.starts_with('X') {
            self.players[slot].orientation = self.players[slot].orientation.toggled();
            self.send_place_prompt(slot);
            return;
        }

        let (name, size) = SHIPS[self.players[slot].ships_placed];
        let orientation = self.players[slot].orientation;

        match parse_coordinate(&coords) {
            Ok((row, col)) => {
                if self.players[slot].board.can_place_ship(row, col, size, orientation) {
                    self.players[slot].board.do_place_ship(name, row, col, size, orientation);
                    self.players[slot].ships_placed += 1;
                    self.announce_to_spectators(format!("PLAYER {} PLACED THEIR {}", slot, name));
                } else {
                    self.send(
                        id,
                        MessageKind::Text,
                        MessageKind::Place,
                        format!(
                            "[!] Cannot place {} at {} (orientation={}). Try again.",
                            name,
                            coords,
                            orientation.word()
                        ),
                    );
                }
            }
            Err(err) => {
                self.send(
                    id,
                    MessageKind::Text,
                    MessageKind::Place,
                    format!("[!] Invalid coordinate: {}", err),
                );
            }
        }

        // Re-prompt with the next ship, or the same one after a failure.
        self.send_place_prompt(slot);
    }

    /// One shot at the opponent's board. `QUIT` forfeits the match.
    pub(crate) fn fire(&mut self, id: ClientId, payload: &str, now: Instant) {
        let slot = match self.player_slot(id) {
            Some(slot) => slot,
            None => return,
        };

        let coords = payload.trim().to_uppercase();

        if coords == "QUIT" {
            self.forfeit(slot, now);
            return;
        }

        if self.turn != Some(slot) {
            self.send(
                id,
                MessageKind::Text,
                MessageKind::Fire,
                "Fired out of turn, command ignored. Waiting for opponent to fire...",
            );
            return;
        }

        let (row, col) = match parse_coordinate(&coords) {
            Ok(cell) => cell,
            Err(err) => {
                self.send(id, MessageKind::Text, MessageKind::Fire, format!("Invalid input: {}", err));
                self.send_fire_prompt(slot);
                return;
            }
        };

        let opponent = 1 - slot;
        let outcome = self.players[opponent].board.fire_at(row, col);

        let (result_text, opponent_text, spectator_text) = match outcome {
            FireOutcome::AlreadyShot => {
                // No turn lost; fire again.
                self.send(
                    id,
                    MessageKind::Result,
                    MessageKind::Fire,
                    "REPEAT You've already fired at that location.",
                );
                self.send_fire_prompt(slot);
                return;
            }
            FireOutcome::Hit { sunk: Some(ship) } => (
                format!("HIT You sank the {}!", ship),
                format!("OPPONENT HIT {}! Opponent sunk your {}!", coords, ship),
                format!(
                    "PLAYER {} FIRED AT {} AND HIT! PLAYER {} SANK PLAYER {}'s {}!",
                    slot, coords, slot, opponent, ship
                ),
            ),
            FireOutcome::Hit { sunk: None } => (
                "HIT".to_owned(),
                format!("OPPONENT HIT {}!", coords),
                format!("PLAYER {} FIRED AT {} AND HIT!", slot, coords),
            ),
            FireOutcome::Miss => (
                "MISS".to_owned(),
                "OPPONENT MISSED".to_owned(),
                format!("PLAYER {} FIRED AT {} AND MISSED!", slot, coords),
            ),
        };

        self.send_battle_board(slot);
        self.send(id, MessageKind::Result, MessageKind::Fire, result_text);
        if let Some(opponent_id) = self.players[opponent].client {
            self.send(opponent_id, MessageKind::Result, MessageKind::Fire, opponent_text);
        }
        self.announce_to_spectators(spectator_text);

        self.end_player_turn(slot);
    }

    fn end_player_turn(&mut self, slot: usize) {
        self.players[slot].moves += 1;

        let next = 1 - slot;
        self.turn = Some(next);

        // The driver ends the match if the fleet just fired at is gone.
        if !self.players[next].board.all_ships_sunk() {
            self.send_fire_prompt(next);
        }
    }

    fn forfeit(&mut self, slot: usize, now: Instant) {
        logging::info!(self.log, "player forfeited"; "slot" => slot);

        if let Some(id) = self.players[slot].client {
            self.text(id, "Thanks for playing!");
        }
        if let Some(id) = self.players[1 - slot].client {
            self.text(id, "Other player has decided to quit. Thanks for playing!");
        }

        self.state = GameState::End;
        self.turn = None;
        self.game_number += 1;
        self.cooldown_until = Some(now + self.cooldown);
        self.effects.push(Effect::CloseAll);
    }

    // ------------------------------------------------------------------
    // Outbound messages
    // ------------------------------------------------------------------

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn send(
        &mut self,
        to: ClientId,
        kind: MessageKind,
        expected: MessageKind,
        text: impl Into<String>,
    ) {
        self.effects.push(Effect::Send {
            to,
            kind,
            expected,
            text: text.into(),
        });
    }

    /// Plain human-readable line.
    pub(crate) fn text(&mut self, to: ClientId, text: impl Into<String>) {
        self.send(to, MessageKind::Text, MessageKind::Chat, text);
    }

    pub(crate) fn send_waiting_message(&mut self, id: ClientId) {
        let text = format!(
            "Waiting for game to start... Clients connected [{}/2]",
            self.roster.len()
        );
        self.text(id, text);
    }

    /// Relays a chat line to every other client, prefixed by the sender.
    pub(crate) fn chat(&mut self, id: ClientId, text: &str) {
        let username = match self.roster.get(&id) {
            Some(info) => info.username.clone(),
            None => return,
        };

        let expected = match self.state {
            GameState::Place => MessageKind::Place,
            _ => MessageKind::Fire,
        };

        let line = format!("[{}]: {}", username, text);
        let others: Vec<ClientId> = self.roster.keys().copied().filter(|&other| other != id).collect();

        for other in others {
            self.send(other, MessageKind::Chat, expected, line.clone());
        }
    }

    fn announce_to_all(&mut self, text: impl Into<String>) {
        let text = text.into();
        let ids: Vec<ClientId> = self.roster.keys().copied().collect();
        for id in ids {
            self.text(id, text.clone());
        }
    }

    fn announce_to_players(&mut self, text: impl Into<String>) {
        let text = text.into();
        for id in self.player_client_ids() {
            self.text(id, text.clone());
        }
    }

    /// Everyone in the roster who is not bound to a player slot.
    fn announce_to_spectators(&mut self, text: impl Into<String>) {
        let text = text.into();
        let players = self.player_client_ids();
        let spectators: Vec<ClientId> = self
            .roster
            .keys()
            .copied()
            .filter(|id| !players.contains(id))
            .collect();

        for id in spectators {
            self.text(id, text.clone());
        }
    }

    /// The player's own board, ships visible, followed by the placement
    /// prompt for the next ship of the sequence.
    fn send_place_prompt(&mut self, slot: usize) {
        let (id, board, placed, orientation) = {
            let player = &self.players[slot];
            match player.client {
                Some(id) => (id, player.board.render(true), player.ships_placed, player.orientation),
                None => return,
            }
        };

        self.send(id, MessageKind::Board, MessageKind::Place, board);

        if placed >= SHIPS_PER_PLAYER {
            self.text(id, "All ships placed. Waiting for opponent...");
            return;
        }

        let (name, size) = SHIPS[placed];
        self.send(
            id,
            MessageKind::Text,
            MessageKind::Place,
            format!(
                "Place {} (Size: {}) {}. Enter 'x' to change orientation.",
                name,
                size,
                orientation.word()
            ),
        );
    }

    /// The opponent's public board and the fire prompt; spectators follow
    /// the firing player's view of the battle.
    fn send_fire_prompt(&mut self, slot: usize) {
        let id = match self.players[slot].client {
            Some(id) => id,
            None => return,
        };

        self.send_battle_board(slot);
        self.send(
            id,
            MessageKind::Text,
            MessageKind::Fire,
            "Enter coordinate to fire at (e.g. B5): ",
        );
        self.announce_to_spectators(format!("PLAYER {} FIRING", slot));
    }

    /// Sends the opponent's public view to the player at `slot`, and to the
    /// spectators while the battle is on.
    fn send_battle_board(&mut self, slot: usize) {
        let id = match self.players[slot].client {
            Some(id) => id,
            None => return,
        };

        let board = self.players[1 - slot].board.render(false);
        self.send(id, MessageKind::Board, MessageKind::Place, board.clone());

        if self.state == GameState::Battle {
            let players = self.player_client_ids();
            let spectators: Vec<ClientId> = self
                .roster
                .keys()
                .copied()
                .filter(|spectator| !players.contains(spectator))
                .collect();

            for spectator in spectators {
                self.send(spectator, MessageKind::Board, MessageKind::Chat, board.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semaphore::frame::{Frame, PacketKind};
    use semaphore::shared::Seq;

    const COOLDOWN: Duration = Duration::from_secs(5);

    fn game() -> Game {
        Game::new(COOLDOWN, None)
    }

    fn data(kind: MessageKind, sender: ClientId, payload: &str) -> Frame {
        Frame::new(Seq(0), PacketKind::Data, kind, MessageKind::Text, sender, payload)
    }

    fn texts_to(effects: &[Effect], target: ClientId) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send { to, text, .. } if *to == target => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn contains_text(effects: &[Effect], target: ClientId, needle: &str) -> bool {
        texts_to(effects, target).iter().any(|text| text.contains(needle))
    }

    fn connect_two(game: &mut Game, now: Instant) {
        game.on_client_connected(1);
        game.on_client_connected(2);
        game.dispatch(1, &data(MessageKind::Connect, 1, "alice"), now);
        game.dispatch(2, &data(MessageKind::Connect, 2, "bob"), now);
        game.take_effects();
    }

    /// One ship per row, all horizontal in column 1.
    const FLEET: [&str; SHIPS_PER_PLAYER] = ["A1", "B1", "C1", "D1", "E1"];

    fn place_fleets(game: &mut Game, now: Instant) {
        for &coords in &FLEET {
            for id in 1..=2 {
                game.dispatch(id, &data(MessageKind::Place, id, coords), now);
            }
        }
    }

    fn advance_to_battle(game: &mut Game, now: Instant) {
        connect_two(game, now);
        game.tick(now);
        assert_eq!(game.state, GameState::Place);

        place_fleets(game, now);
        game.tick(now);
        assert_eq!(game.state, GameState::Battle);

        game.take_effects();
    }

    /// Every cell occupied by the `FLEET` layout.
    fn ship_cells() -> Vec<String> {
        SHIPS
            .iter()
            .enumerate()
            .flat_map(|(index, &(_, size))| {
                let row = (b'A' + index as u8) as char;
                (1..=size).map(move |col| format!("{}{}", row, col))
            })
            .collect()
    }

    #[test]
    fn test_connect_assigns_id_and_reports_state() {
        let mut game = game();

        game.on_client_connected(1);
        let effects = game.take_effects();

        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Send { to: 1, kind: MessageKind::Connect, text, .. } if text == "1"
        )));
        assert!(contains_text(&effects, 1, "Waiting for game to start... Clients connected [1/2]"));
    }

    #[test]
    fn test_late_joiner_becomes_spectator() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        game.on_client_connected(3);
        let effects = game.take_effects();

        assert!(contains_text(&effects, 3, "YOU ARE CURRENTLY SPECTATING"));
        assert!(!game.is_player(3));
    }

    #[test]
    fn test_clean_two_player_match() {
        let mut game = game();
        let now = Instant::now();

        connect_two(&mut game, now);
        game.tick(now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::Place);
        assert!(contains_text(&effects, 1, "GAME STARTING"));
        assert!(contains_text(&effects, 2, "GAME STARTING"));
        assert!(contains_text(&effects, 1, "YOU ARE PLAYER 0"));
        assert!(contains_text(&effects, 2, "YOU ARE PLAYER 1"));
        assert!(contains_text(&effects, 1, "Place Carrier (Size: 5) horizontally"));
        assert_eq!(game.players[0].client, Some(1));
        assert_eq!(game.players[1].client, Some(2));

        place_fleets(&mut game, now);
        assert_eq!(game.players[0].ships_placed, SHIPS_PER_PLAYER);
        assert_eq!(game.players[1].ships_placed, SHIPS_PER_PLAYER);

        game.tick(now);
        let effects = game.take_effects();
        assert_eq!(game.state, GameState::Battle);
        assert!(contains_text(&effects, 1, "BATTLE STARTING"));

        // The opening player shells the fleet cell by cell; the other one
        // walks harmless water rows.
        let shooter_slot = game.turn.expect("battle has a turn");
        let shooter = game.players[shooter_slot].client.unwrap();
        let idler = game.players[1 - shooter_slot].client.unwrap();

        let mut hits = ship_cells().into_iter();
        let mut misses = (1..=10)
            .flat_map(|col| vec![format!("F{}", col), format!("G{}", col)])
            .collect::<Vec<_>>()
            .into_iter();

        let mut rounds = 0;
        while game.state == GameState::Battle {
            rounds += 1;
            assert!(rounds < 100, "battle failed to converge");

            let turn_client = game.players[game.turn.unwrap()].client.unwrap();
            let coords = if turn_client == shooter {
                hits.next().unwrap()
            } else {
                misses.next().unwrap()
            };

            game.dispatch(turn_client, &data(MessageKind::Fire, turn_client, &coords), now);
            game.tick(now);
        }

        let effects = game.take_effects();
        assert_eq!(game.state, GameState::End);
        assert!(contains_text(&effects, shooter, "HIT"));
        assert!(contains_text(&effects, shooter, "HIT You sank the Carrier!"));
        assert!(contains_text(&effects, idler, "OPPONENT HIT A1!"));
        assert!(contains_text(&effects, shooter, "YOU WIN!!!"));
        assert!(contains_text(&effects, shooter, "You won in 17 moves!"));
        assert!(contains_text(&effects, idler, "You lose"));
    }

    #[test]
    fn test_out_of_turn_fire_never_touches_the_board() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        let turn_slot = game.turn.unwrap();
        let idler_slot = 1 - turn_slot;
        let idler = game.players[idler_slot].client.unwrap();

        game.dispatch(idler, &data(MessageKind::Fire, idler, "A1"), now);
        let effects = game.take_effects();

        assert!(contains_text(&effects, idler, "Fired out of turn"));
        assert_eq!(game.turn, Some(turn_slot));
        // The target board shows no shot anywhere.
        assert_eq!(game.players[turn_slot].board.render(false), Board::new().render(false));
    }

    #[test]
    fn test_repeat_shot_keeps_the_turn() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        let turn_slot = game.turn.unwrap();
        let firer = game.players[turn_slot].client.unwrap();

        game.dispatch(firer, &data(MessageKind::Fire, firer, "F5"), now);
        assert_eq!(game.turn, Some(1 - turn_slot));
        game.take_effects();

        // Opponent wastes a shot on the same water cell the firer will
        // then repeat.
        let other = game.players[1 - turn_slot].client.unwrap();
        game.dispatch(other, &data(MessageKind::Fire, other, "F6"), now);
        game.take_effects();

        game.dispatch(firer, &data(MessageKind::Fire, firer, "F5"), now);
        let effects = game.take_effects();

        assert!(contains_text(&effects, firer, "REPEAT You've already fired at that location."));
        assert_eq!(game.turn, Some(turn_slot));
    }

    #[test]
    fn test_invalid_fire_input_retains_turn() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        let turn_slot = game.turn.unwrap();
        let firer = game.players[turn_slot].client.unwrap();

        game.dispatch(firer, &data(MessageKind::Fire, firer, "Z99"), now);
        let effects = game.take_effects();

        assert!(contains_text(&effects, firer, "Invalid input:"));
        assert!(contains_text(&effects, firer, "Enter coordinate to fire at"));
        assert_eq!(game.turn, Some(turn_slot));
    }

    #[test]
    fn test_orientation_toggle_and_bad_placement() {
        let mut game = game();
        let now = Instant::now();

        connect_two(&mut game, now);
        game.tick(now);
        game.take_effects();

        game.dispatch(1, &data(MessageKind::Place, 1, "x"), now);
        let effects = game.take_effects();
        assert!(contains_text(&effects, 1, "Place Carrier (Size: 5) vertically"));

        // A vertical carrier cannot start on row J.
        game.dispatch(1, &data(MessageKind::Place, 1, "J1"), now);
        let effects = game.take_effects();
        assert!(contains_text(&effects, 1, "[!] Cannot place Carrier at J1 (orientation=vertically)."));
        assert_eq!(game.players[0].ships_placed, 0);

        game.dispatch(1, &data(MessageKind::Place, 1, "A1"), now);
        let effects = game.take_effects();
        assert_eq!(game.players[0].ships_placed, 1);
        assert!(contains_text(&effects, 1, "Place Battleship (Size: 4) vertically"));
    }

    #[test]
    fn test_reconnect_resumes_battle() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        let turn_before = game.turn;
        let moves_before = [game.players[0].moves, game.players[1].moves];

        game.on_client_disconnected(1, now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::Pause);
        assert_eq!(game.previous_state, GameState::Battle);
        assert!(effects.contains(&Effect::ArmGraceTimer));
        assert!(contains_text(&effects, 2, "has disconnected, waiting for reconnect"));

        // A fresh session asserting the same identity resumes the match.
        game.on_client_connected(3);
        game.dispatch(3, &data(MessageKind::Connect, 3, "alice"), now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::Battle);
        assert_eq!(game.players[0].client, Some(3));
        assert_eq!(game.turn, turn_before);
        assert_eq!([game.players[0].moves, game.players[1].moves], moves_before);
        assert_eq!(game.players[0].ships_placed, SHIPS_PER_PLAYER);
        assert!(effects.contains(&Effect::CancelGraceTimer));
        assert!(contains_text(&effects, 3, "Welcome back alice, the game will now resume"));
        assert!(contains_text(&effects, 3, "Enter coordinate to fire at"));
        assert!(contains_text(&effects, 2, "Enter coordinate to fire at"));
    }

    #[test]
    fn test_wrong_username_does_not_resume() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        game.on_client_disconnected(1, now);
        game.take_effects();

        game.on_client_connected(3);
        game.dispatch(3, &data(MessageKind::Connect, 3, "mallory"), now);
        game.take_effects();

        assert_eq!(game.state, GameState::Pause);
        assert_eq!(game.players[0].client, None);
    }

    #[test]
    fn test_grace_expiry_ends_match() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        game.on_client_disconnected(1, now);
        game.take_effects();

        game.on_grace_expired(now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::End);
        assert!(contains_text(&effects, 2, "GAME OVER"));

        // After the cool-down the server is ready to host a fresh match.
        game.tick(now + COOLDOWN + Duration::from_secs(1));
        assert_eq!(game.state, GameState::Wait);
        assert_eq!(game.players[0].client, None);
    }

    #[test]
    fn test_second_disconnect_ends_immediately() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        game.on_client_disconnected(1, now);
        game.take_effects();
        assert_eq!(game.state, GameState::Pause);

        game.on_client_disconnected(2, now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::End);
        assert!(effects.contains(&Effect::CancelGraceTimer));
    }

    #[test]
    fn test_spectator_disconnect_never_pauses() {
        let mut game = game();
        let now = Instant::now();

        game.on_client_connected(1);
        game.on_client_connected(2);
        game.on_client_connected(3);
        game.dispatch(1, &data(MessageKind::Connect, 1, "alice"), now);
        game.dispatch(2, &data(MessageKind::Connect, 2, "bob"), now);
        game.dispatch(3, &data(MessageKind::Connect, 3, "carol"), now);
        game.tick(now);
        game.take_effects();
        assert_eq!(game.state, GameState::Place);

        game.on_client_disconnected(3, now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::Place);
        assert!(!effects.contains(&Effect::ArmGraceTimer));
    }

    #[test]
    fn test_quit_forfeits_and_closes() {
        let mut game = game();
        let now = Instant::now();
        advance_to_battle(&mut game, now);

        // Quitting works from either side, in or out of turn.
        let idler = game.players[1 - game.turn.unwrap()].client.unwrap();
        let other = game.players[game.turn.unwrap()].client.unwrap();

        game.dispatch(idler, &data(MessageKind::Fire, idler, "quit"), now);
        let effects = game.take_effects();

        assert_eq!(game.state, GameState::End);
        assert!(contains_text(&effects, idler, "Thanks for playing!"));
        assert!(contains_text(&effects, other, "Other player has decided to quit. Thanks for playing!"));
        assert!(effects.contains(&Effect::CloseAll));
    }

    #[test]
    fn test_spectators_see_public_boards_and_placements() {
        let mut game = game();
        let now = Instant::now();

        game.on_client_connected(1);
        game.on_client_connected(2);
        game.on_client_connected(3);
        game.dispatch(1, &data(MessageKind::Connect, 1, "alice"), now);
        game.dispatch(2, &data(MessageKind::Connect, 2, "bob"), now);
        game.dispatch(3, &data(MessageKind::Connect, 3, "carol"), now);
        game.tick(now);
        let effects = game.take_effects();
        assert!(contains_text(&effects, 3, "YOU ARE A SPECTATOR"));

        place_fleets(&mut game, now);
        let effects = game.take_effects();
        assert!(contains_text(&effects, 3, "PLAYER 0 PLACED THEIR Carrier"));

        game.tick(now);
        let effects = game.take_effects();
        assert_eq!(game.state, GameState::Battle);

        // Spectators follow the battle through the public view only: no
        // board shown to them ever includes an unhit ship cell.
        let spectator_boards: Vec<&String> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send { to: 3, kind: MessageKind::Board, text, .. } => Some(text),
                _ => None,
            })
            .collect();

        assert!(!spectator_boards.is_empty());
        assert!(spectator_boards.iter().all(|board| !board.contains('S')));
    }

    #[test]
    fn test_player_rotation_across_matches() {
        let mut game = game();
        let now = Instant::now();

        game.game_number = 1;
        game.on_client_connected(1);
        game.on_client_connected(2);
        game.on_client_connected(3);
        game.tick(now);

        // Second match: the rotation starts at roster index 2.
        assert_eq!(game.players[0].client, Some(3));
        assert_eq!(game.players[1].client, Some(1));
    }

    #[test]
    fn test_chat_reaches_everyone_else() {
        let mut game = game();
        let now = Instant::now();

        game.on_client_connected(1);
        game.on_client_connected(2);
        game.on_client_connected(3);
        game.dispatch(1, &data(MessageKind::Connect, 1, "alice"), now);
        game.take_effects();

        game.dispatch(1, &data(MessageKind::Chat, 1, "good luck!"), now);
        let effects = game.take_effects();

        assert!(contains_text(&effects, 2, "[alice]: good luck!"));
        assert!(contains_text(&effects, 3, "[alice]: good luck!"));
        assert!(texts_to(&effects, 1).is_empty());
    }
}
