pub use jingle_stanza as stanza;

pub mod net;
pub mod stats;
pub mod types;
