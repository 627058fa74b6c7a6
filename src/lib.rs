mod burrow;

pub use burrow::*;
