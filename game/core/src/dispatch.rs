//! Inbound message dispatch: every application frame a peer delivers is
//! validated against the current phase, the peer's role and the turn before
//! any game operation runs. Mismatches get an explanatory TEXT back and
//! change nothing.

use crate::game::{Effect, Game, GameState};
use semaphore::frame::{Frame, MessageKind};
use semaphore::shared::ClientId;
use std::time::Instant;

impl Game {
    /// Routes one in-order application frame from `client`.
    ///
    /// The client id comes from the session that delivered the frame, not
    /// from the frame's sender field; a peer cannot act as anyone else.
    pub fn dispatch(&mut self, client: ClientId, frame: &Frame, now: Instant) {
        match frame.message {
            MessageKind::Chat => self.chat(client, &frame.payload),
            MessageKind::Connect => self.set_username(client, frame.payload.trim()),
            // The registry runs the actual teardown; the disconnect/pause
            // logic follows from the connection change it reports.
            MessageKind::Disconnect => self.push_effect(Effect::Close(client)),
            // Display-only on the peer; carries no server semantics.
            MessageKind::Text => (),
            // Server-originated kinds are ignored when they arrive inbound.
            MessageKind::Board | MessageKind::Result => (),
            MessageKind::Place => self.dispatch_place(client, frame),
            MessageKind::Fire => self.dispatch_fire(client, frame, now),
        }
    }

    fn dispatch_place(&mut self, client: ClientId, frame: &Frame) {
        if !self.is_player(client) {
            self.send(client, MessageKind::Text, MessageKind::Chat, "Incorrect message type.");
            return;
        }

        match self.state() {
            GameState::Place => self.place_ship(client, &frame.payload),
            GameState::Wait => self.send_waiting_message(client),
            GameState::Battle => self.send(
                client,
                MessageKind::Text,
                MessageKind::Fire,
                "Incorrect command type, the battle has already started.",
            ),
            GameState::Pause => self.send_paused_message(client),
            GameState::End => self.send_ended_message(client),
        }
    }

    fn dispatch_fire(&mut self, client: ClientId, frame: &Frame, now: Instant) {
        if !self.is_player(client) {
            self.send(client, MessageKind::Text, MessageKind::Chat, "Incorrect message type.");
            return;
        }

        match self.state() {
            GameState::Battle => self.fire(client, &frame.payload, now),
            GameState::Wait => self.send_waiting_message(client),
            GameState::Place => self.send(
                client,
                MessageKind::Text,
                MessageKind::Place,
                "Incorrect command type, ships are still being placed.",
            ),
            GameState::Pause => self.send_paused_message(client),
            GameState::End => self.send_ended_message(client),
        }
    }

    fn send_paused_message(&mut self, client: ClientId) {
        self.text(client, "Game is paused, waiting for a player to reconnect.");
    }

    fn send_ended_message(&mut self, client: ClientId) {
        self.text(client, "Game has ended. Thank you for playing!");
    }
}
