pub mod config;
pub mod error;
pub mod parser;
pub mod session;
pub mod simulated;

pub use config::{ConnectionConfig, SessionTimeouts, DEFAULT_READER_PORT};
pub use error::{SessionError, SessionErrorKind};
pub use parser::{parse_tag_list, parse_tag_list_at, ParseWarning, ParsedTagList};
pub use session::{AlienSession, SessionState, TagSource, TAG_LIST_COMMAND};
pub use simulated::SimulatedReader;
