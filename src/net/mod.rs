pub mod icy;
pub mod reader;

pub use icy::*;
pub use reader::*;
