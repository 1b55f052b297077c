pub mod error;
pub mod manager;
pub mod output;
pub mod session;

pub use error::TermkeepError;
pub use manager::{ManagerConfig, SessionManager};
pub use output::OutputBuffer;
pub use session::{INPUT_QUEUE_CAPACITY, OUTPUT_QUEUE_CAPACITY, OutputSink, Session, SessionCreateOptions};
