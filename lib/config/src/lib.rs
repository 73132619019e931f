//! Process-wide configuration constants and knobs.

pub mod mm;
