//! Small internal utilities.

pub mod arena;

pub use arena::{Arena, ArenaIndex};
