//! Game logic for the Battleship server: the board model, the authoritative
//! match state machine, the inbound message dispatcher and the server
//! configuration.

pub mod board;
pub mod config;
pub mod dispatch;
pub mod game;
