//! # Scribe Core
//!
//! Operational transformation for plain text.
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌─────────────┐    ┌─────────┐
//! │    Op    │───►│ Operation │───►│  transform  │───►│ Session │
//! │ R / D / I│    │  builder  │    │ (a,b)→(a',b')│   │ history │
//! └──────────┘    └───────────┘    └─────────────┘    └─────────┘
//!                       │                                  ▲
//!                       ▼                                  │
//!                 ┌───────────┐                            │
//!                 │ Selection │────────────────────────────┘
//!                 └───────────┘
//! ```
//!
//! ```
//! use scribe_core::{Operation, Session};
//!
//! let mut session = Session::new("I love you.");
//!
//! let mut she = Operation::new();
//! she.delete(1).insert("She").retain(10);
//! session.add_operation(0, she).unwrap();
//!
//! // Written against revision 0, rebased onto revision 1.
//! let mut really = Operation::new();
//! really.retain(2).insert("really ").retain(9);
//! session.add_operation(0, really).unwrap();
//!
//! assert_eq!(session.document(), "She really love you.");
//! ```

pub mod encoding;
pub mod error;
pub mod operation;
pub mod selection;
pub mod session;
pub mod transform;

pub use encoding::TextEncoding;
pub use error::OtError;
pub use operation::{Op, Operation, MAX_UNITS};
pub use selection::{transform_index, Range, Selection};
pub use session::{Client, ClientId, Session};
pub use transform::transform;
