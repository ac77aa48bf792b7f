pub mod dispatcher;
pub mod prompt;
pub mod session;
pub mod shell;
pub mod transcript;


pub use session::{Session, SessionBuilder};
pub use transcript::{InMemoryTranscript, Role, TranscriptStore, Turn, TurnContent};
