use semaphore::channel::RetransmitConfig;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Serialize, Deserialize, Clone)]
pub struct Server {
    pub address: String,
    /// Upper bound on simultaneous clients; capped by the 7-bit id space.
    pub max_clients: u16,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Game {
    /// Event-loop poll interval; bounds timer and driver latency.
    pub tick_ms: u64,
    /// Idle cutoff for players: no frame for this long means disconnect.
    pub idle_timeout_secs: u64,
    /// How long a paused match waits for the missing player to return.
    pub reconnect_grace_secs: u64,
    /// Pause between the end of one match and the start of the next.
    pub cooldown_secs: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Protocol {
    pub retransmit_initial_ms: u64,
    pub retransmit_ceiling_ms: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct GameConfig {
    pub server: Server,
    pub game: Game,
    pub protocol: Protocol,
}

impl Default for GameConfig {
    fn default() -> GameConfig {
        GameConfig {
            server: Server {
                address: format!("127.0.0.1:{}", DEFAULT_PORT),
                max_clients: 127,
            },
            game: Game {
                tick_ms: 50,
                idle_timeout_secs: 30,
                reconnect_grace_secs: 30,
                cooldown_secs: 5,
            },
            protocol: Protocol {
                retransmit_initial_ms: 500,
                retransmit_ceiling_ms: 5000,
            },
        }
    }
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GameConfig {
        serdeconv::from_toml_file(path).expect("Error loading game configuration file")
    }
}

impl Game {
    #[inline]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[inline]
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    #[inline]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Protocol {
    #[inline]
    pub fn retransmit(&self) -> RetransmitConfig {
        RetransmitConfig {
            initial: Duration::from_millis(self.retransmit_initial_ms),
            ceiling: Duration::from_millis(self.retransmit_ceiling_ms),
        }
    }
}
