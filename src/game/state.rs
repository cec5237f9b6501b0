use super::board::{evaluate_winner, is_draw, Board, BoardSize, Mark};

/// Canonical in-memory game: board, whose turn it is, and terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    pub board: Board,
    pub current_player: Mark,
    pub winner: Option<Mark>,
    pub is_draw: bool,
}

impl GameState {
    pub fn new(size: BoardSize, starting: Mark) -> Self {
        Self {
            board: Board::empty(size),
            current_player: starting,
            winner: None,
            is_draw: false,
        }
    }

    /// Fresh 3x3 game, X to move
    pub fn network() -> Self {
        Self::new(BoardSize::Three, Mark::X)
    }

    pub fn is_over(&self) -> bool {
        self.winner.is_some() || self.is_draw
    }

    /// Apply one move. Rejected when the game is over, the cell is taken,
    /// or the index is off the board; the state is untouched in that case.
    pub fn apply_move(&mut self, index: usize, mark: Mark) -> bool {
        if self.is_over() || !self.board.place(index, mark) {
            return false;
        }
        self.current_player = mark.other();
        self.refresh_outcome();
        true
    }

    /// Re-derive winner/draw from the board
    pub fn refresh_outcome(&mut self) {
        self.winner = evaluate_winner(&self.board);
        self.is_draw = self.winner.is_none() && is_draw(&self.board);
    }

    /// Reset for a rematch, keeping the board size
    pub fn reset(&mut self, starting: Mark) {
        *self = Self::new(self.board.size(), starting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_alternate_on_accepted_moves() {
        let mut game = GameState::network();
        let mut expected = Mark::X;
        for index in [0, 4, 8, 2, 6] {
            assert_eq!(game.current_player, expected);
            assert!(game.apply_move(index, expected));
            expected = expected.other();
        }
    }

    #[test]
    fn test_occupied_cell_leaves_state_unchanged() {
        let mut game = GameState::network();
        assert!(game.apply_move(4, Mark::X));
        let before = game.clone();
        assert!(!game.apply_move(4, Mark::O));
        assert_eq!(game, before);
    }

    #[test]
    fn test_no_moves_after_win() {
        let mut game = GameState::network();
        for (index, mark) in [(0, Mark::X), (3, Mark::O), (1, Mark::X), (4, Mark::O), (2, Mark::X)] {
            assert!(game.apply_move(index, mark));
        }
        assert_eq!(game.winner, Some(Mark::X));
        assert!(!game.apply_move(5, Mark::O));
    }

    #[test]
    fn test_reset_clears_terminal_state() {
        let mut game = GameState::new(BoardSize::Four, Mark::X);
        game.apply_move(0, Mark::X);
        game.winner = Some(Mark::X);
        game.reset(Mark::O);
        assert!(game.board.is_empty());
        assert_eq!(game.board.size(), BoardSize::Four);
        assert_eq!(game.current_player, Mark::O);
        assert!(!game.is_over());
    }
}
