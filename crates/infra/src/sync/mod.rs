//! Email sync pipeline: settings, parsers and the orchestrating service.

pub mod parser;
pub mod service;
pub mod settings;

pub use parser::{EmailParser, KeywordParser, ParseError, ParsedEmail};
pub use service::{EmailSyncService, SyncError, SyncRequest};
pub use settings::{SyncSettings, PREVIEW_LIMIT};
