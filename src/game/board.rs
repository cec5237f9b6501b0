// Board model and the pure evaluation functions shared by every game mode
// Networked games always use the 3x3 board; larger boards are offline-only

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of cells on a networked (3x3) board
pub const NETWORK_CELLS: usize = 9;

/// Player marker. The side that initiates a session always plays X.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn other(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::X => write!(f, "X"),
            Mark::O => write!(f, "O"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardSize {
    Three,
    Four,
    Five,
}

impl BoardSize {
    pub fn side(self) -> usize {
        match self {
            BoardSize::Three => 3,
            BoardSize::Four => 4,
            BoardSize::Five => 5,
        }
    }

    pub fn cells(self) -> usize {
        self.side() * self.side()
    }

    pub fn from_side(side: usize) -> Option<BoardSize> {
        match side {
            3 => Some(BoardSize::Three),
            4 => Some(BoardSize::Four),
            5 => Some(BoardSize::Five),
            _ => None,
        }
    }
}

/// Square board of optional marks, row-major.
///
/// Serialized as a bare JSON array (`["X", null, "O", ...]`); the side length
/// is recovered from the cell count when deserializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: BoardSize,
    cells: Vec<Option<Mark>>,
}

impl Board {
    pub fn empty(size: BoardSize) -> Self {
        Self {
            size,
            cells: vec![None; size.cells()],
        }
    }

    /// Empty 3x3 board used by every networked session
    pub fn network() -> Self {
        Self::empty(BoardSize::Three)
    }

    /// Build a 3x3 board from whatever a remote peer or store handed us.
    /// Short inputs are padded with empty cells, long inputs truncated.
    pub fn normalized(mut cells: Vec<Option<Mark>>) -> Self {
        cells.resize(NETWORK_CELLS, None);
        Self {
            size: BoardSize::Three,
            cells,
        }
    }

    pub fn size(&self) -> BoardSize {
        self.size
    }

    pub fn cells(&self) -> &[Option<Mark>] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    pub fn get(&self, index: usize) -> Option<Mark> {
        self.cells.get(index).copied().flatten()
    }

    pub fn is_cell_empty(&self, index: usize) -> bool {
        index < self.cells.len() && self.cells[index].is_none()
    }

    /// Place `mark` at `index`. Only an in-range empty cell accepts a mark.
    pub fn place(&mut self, index: usize, mark: Mark) -> bool {
        if !self.is_cell_empty(index) {
            return false;
        }
        self.cells[index] = Some(mark);
        true
    }

    pub fn count(&self, mark: Mark) -> usize {
        self.cells.iter().filter(|c| **c == Some(mark)).count()
    }
}

impl Serialize for Board {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.cells.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Board {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cells = Vec::<Option<Mark>>::deserialize(deserializer)?;
        let side = (cells.len() as f64).sqrt() as usize;
        match BoardSize::from_side(side) {
            Some(size) if size.cells() == cells.len() => Ok(Board { size, cells }),
            _ => Ok(Board::normalized(cells)),
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = self.size.side();
        for row in 0..side {
            let line: Vec<String> = (0..side)
                .map(|col| {
                    let index = row * side + col;
                    match self.cells[index] {
                        Some(mark) => mark.to_string(),
                        None => (index + 1).to_string(),
                    }
                })
                .collect();
            writeln!(f, " {}", line.join(" | "))?;
        }
        Ok(())
    }
}

/// Every row, column and both diagonals for a board of the given size
pub fn winning_combinations(size: BoardSize) -> Vec<Vec<usize>> {
    let side = size.side();
    let mut combinations = Vec::with_capacity(side * 2 + 2);

    for row in 0..side {
        combinations.push((0..side).map(|col| row * side + col).collect());
    }
    for col in 0..side {
        combinations.push((0..side).map(|row| row * side + col).collect());
    }
    combinations.push((0..side).map(|i| i * side + i).collect());
    combinations.push((0..side).map(|i| i * side + (side - 1 - i)).collect());

    combinations
}

/// Cells of the first complete line, if any
pub fn winning_line(board: &Board) -> Option<Vec<usize>> {
    winning_combinations(board.size())
        .into_iter()
        .find(|line| match board.get(line[0]) {
            Some(first) => line.iter().all(|&i| board.get(i) == Some(first)),
            None => false,
        })
}

pub fn evaluate_winner(board: &Board) -> Option<Mark> {
    winning_line(board).and_then(|line| board.get(line[0]))
}

pub fn is_board_full(board: &Board) -> bool {
    board.cells().iter().all(Option::is_some)
}

/// A full board with no completed line
pub fn is_draw(board: &Board) -> bool {
    is_board_full(board) && evaluate_winner(board).is_none()
}
