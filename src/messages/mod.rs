pub mod storage;
pub mod types;

pub use storage::Transcript;
pub use types::{Message, Sender};
