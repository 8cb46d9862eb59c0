//! Linear webhook intake: signature check, payload parsing, slash commands
//! and the per-issue event router.

pub mod directive;
pub mod events;
pub mod router;
pub mod signature;

pub use directive::{Command, Directive, parse_directive};
pub use events::{CommentCreated, IssueCreated, LinearEvent, ParseError, parse_event};
pub use router::{ActiveRun, Disposition, EventRouter, RouterSettings};
pub use signature::{SIGNATURE_HEADER, compute_signature, verify_signature};
