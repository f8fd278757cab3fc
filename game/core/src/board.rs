//! The Battleship board: ship placement legality, fire resolution and the
//! two views of the grid (the owner's hidden view and the public one shown
//! to the opponent and spectators).

use bosun::choose;
use std::fmt;

pub const BOARD_SIZE: usize = 10;

/// The fleet, placed in this order.
pub const SHIPS: [(&str, usize); 5] = [
    ("Carrier", 5),
    ("Battleship", 4),
    ("Cruiser", 3),
    ("Submarine", 3),
    ("Destroyer", 2),
];

const WATER: char = '.';
const SHIP: char = 'S';
const HIT: char = 'X';
const MISS: char = 'o';

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

impl Orientation {
    #[inline]
    pub fn toggled(self) -> Orientation {
        choose!(self == Orientation::Horizontal => Orientation::Vertical, Orientation::Horizontal)
    }

    /// The adverb used in placement prompts.
    #[inline]
    pub fn word(self) -> &'static str {
        choose!(self == Orientation::Vertical => "vertically", "horizontally")
    }
}

/// Result of firing at a cell.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FireOutcome {
    Hit { sunk: Option<String> },
    Miss,
    AlreadyShot,
}

#[derive(Debug, Eq, PartialEq)]
pub enum CoordinateError {
    Empty,
    BadRow(char),
    BadColumn(String),
}

impl fmt::Display for CoordinateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordinateError::Empty => write!(f, "coordinate is empty"),
            CoordinateError::BadRow(row) => write!(f, "row '{}' is not on the board", row),
            CoordinateError::BadColumn(col) => write!(f, "column '{}' is not on the board", col),
        }
    }
}

/// Parses a grid coordinate such as `B5`: a letter row followed by a decimal
/// column, case-insensitive, whitespace-trimmed. Returns zero-based
/// `(row, col)`.
pub fn parse_coordinate(input: &str) -> Result<(usize, usize), CoordinateError> {
    let input = input.trim().to_uppercase();
    let mut chars = input.chars();

    let row_char = chars.next().ok_or(CoordinateError::Empty)?;
    let row = (row_char as usize).wrapping_sub('A' as usize);
    if !row_char.is_ascii_uppercase() || row >= BOARD_SIZE {
        return Err(CoordinateError::BadRow(row_char));
    }

    let col_str = chars.as_str();
    let col: usize = col_str
        .parse()
        .map_err(|_| CoordinateError::BadColumn(col_str.to_owned()))?;
    if col < 1 || col > BOARD_SIZE {
        return Err(CoordinateError::BadColumn(col_str.to_owned()));
    }

    Ok((row, col - 1))
}

struct Ship {
    name: String,
    cells: Vec<(usize, usize)>,
}

pub struct Board {
    size: usize,
    /// Owner's view: ships visible.
    hidden_grid: Vec<Vec<char>>,
    /// Public view: only hits and misses.
    display_grid: Vec<Vec<char>>,
    ships: Vec<Ship>,
}

impl Board {
    pub fn new() -> Board {
        Board {
            size: BOARD_SIZE,
            hidden_grid: vec![vec![WATER; BOARD_SIZE]; BOARD_SIZE],
            display_grid: vec![vec![WATER; BOARD_SIZE]; BOARD_SIZE],
            ships: Vec::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn run(&self, row: usize, col: usize, size: usize, orientation: Orientation) -> Vec<(usize, usize)> {
        (0..size)
            .map(|offset| match orientation {
                Orientation::Horizontal => (row, col + offset),
                Orientation::Vertical => (row + offset, col),
            })
            .collect()
    }

    /// True if a ship of `size` fits at `(row, col)` without leaving the
    /// board or crossing another ship.
    pub fn can_place_ship(&self, row: usize, col: usize, size: usize, orientation: Orientation) -> bool {
        self.run(row, col, size, orientation)
            .iter()
            .all(|&(r, c)| r < self.size && c < self.size && self.hidden_grid[r][c] == WATER)
    }

    /// Places the ship and returns the occupied cells. The caller must have
    /// checked `can_place_ship`.
    pub fn do_place_ship(
        &mut self,
        name: &str,
        row: usize,
        col: usize,
        size: usize,
        orientation: Orientation,
    ) -> Vec<(usize, usize)> {
        let cells = self.run(row, col, size, orientation);

        for &(r, c) in &cells {
            self.hidden_grid[r][c] = SHIP;
        }
        self.ships.push(Ship {
            name: name.to_owned(),
            cells: cells.clone(),
        });

        cells
    }

    /// Resolves a shot at `(row, col)`, marking both views.
    pub fn fire_at(&mut self, row: usize, col: usize) -> FireOutcome {
        match self.hidden_grid[row][col] {
            SHIP => {
                self.hidden_grid[row][col] = HIT;
                self.display_grid[row][col] = HIT;

                let sunk = self
                    .ships
                    .iter()
                    .find(|ship| ship.cells.contains(&(row, col)))
                    .filter(|ship| ship.cells.iter().all(|&(r, c)| self.hidden_grid[r][c] == HIT))
                    .map(|ship| ship.name.clone());

                FireOutcome::Hit { sunk }
            }
            HIT | MISS => FireOutcome::AlreadyShot,
            _ => {
                self.hidden_grid[row][col] = MISS;
                self.display_grid[row][col] = MISS;
                FireOutcome::Miss
            }
        }
    }

    /// True once every cell of every placed ship has been hit.
    pub fn all_ships_sunk(&self) -> bool {
        !self.ships.is_empty()
            && self
                .ships
                .iter()
                .all(|ship| ship.cells.iter().all(|&(r, c)| self.hidden_grid[r][c] == HIT))
    }

    /// Renders a view of the board as a single payload, rows separated by
    /// `|` so the client can split it back into lines.
    pub fn render(&self, show_hidden: bool) -> String {
        let grid = choose!(show_hidden => &self.hidden_grid, &self.display_grid);

        let mut out = String::from("  ");
        out.push_str(
            &(1..=self.size)
                .map(|col| format!("{:>2}", col))
                .collect::<Vec<_>>()
                .join(" "),
        );
        out.push('|');

        for (index, row) in grid.iter().enumerate() {
            let label = (b'A' + index as u8) as char;
            let cells = row.iter().map(char::to_string).collect::<Vec<_>>().join(" ");
            out.push_str(&format!("{:<2} {}", label, cells));
            out.push('|');
        }

        out
    }
}
