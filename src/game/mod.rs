pub mod board;
pub mod state;

pub use board::{
    evaluate_winner, is_board_full, is_draw, winning_line, Board, BoardSize, Mark, NETWORK_CELLS,
};
pub use state::GameState;
