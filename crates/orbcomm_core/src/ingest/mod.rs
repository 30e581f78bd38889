pub mod email;
pub mod extract;

pub use email::{parse, parse_with_config, ParseFailure, ParserConfig};
