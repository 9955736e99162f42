//! Eviction policy implementations (replacers).
//!
//! Currently implements:
//! - [`ClockReplacer`] - CLOCK / second-chance sweep

mod clock;

pub use clock::ClockReplacer;
