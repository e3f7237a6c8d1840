pub mod buffer;
pub mod parser;
pub mod rodio;
pub mod sink;
pub mod symphonia;

pub use self::buffer::*;
pub use self::parser::*;
pub use self::rodio::{RodioFactory, RodioQueue};
pub use self::sink::*;
pub use self::symphonia::{SymphoniaFactory, SymphoniaStream};
