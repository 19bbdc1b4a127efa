pub mod av;
pub mod call;
pub mod events;
pub mod result;
pub mod sid;
pub mod term;

pub use av::AvFlags;
pub use call::{CallType, EntryKind};
pub use result::{AnswerError, ResultCode};
pub use sid::SessionId;
pub use term::{TermCode, Termination};
