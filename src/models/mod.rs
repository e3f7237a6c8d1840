pub mod format;
pub mod track;

pub use format::*;
pub use track::*;
