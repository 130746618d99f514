pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod models;
pub mod rag;
pub mod registry;
pub mod server;
pub mod session;

pub use engine::{FragmentStream, QueryEngine};
pub use error::ChatError;
pub use registry::SessionRegistry;
pub use session::{ChatSession, Message, Progress, Role, SessionState, SubmitOutcome};
