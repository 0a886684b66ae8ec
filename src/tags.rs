//! Well-known flag bits used by the bundled pipeline.
//!
//! Bits 0..16 are reserved for the pipeline stages, bits 16.. identify
//! languages. Custom prototypes should pick bits from [`USER`] upwards.

use crate::core::Flags;

/// Source directory handed out by the setup task.
pub const SETUP: Flags = Flags::bit(0);
/// A discovered project, regardless of language.
pub const PROJECT: Flags = Flags::bit(1);
/// The gathered set of projects.
pub const SOLUTION: Flags = Flags::bit(2);

pub const CPP: Flags = Flags::bit(16);
pub const SHARP: Flags = Flags::bit(17);
pub const RUST: Flags = Flags::bit(18);

/// First bit free for user-defined tags.
pub const USER: u32 = 24;
