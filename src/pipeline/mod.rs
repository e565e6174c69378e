//! Stage pipeline: discovery, the stage command catalog, the stdout protocol and the executor.

pub mod commands;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod protocol;

pub use commands::IngestProfile;
pub use discovery::{Discovered, discover};
pub use error::{DirListing, StageError};
pub use executor::{JobPlan, StageExecutor};
pub use protocol::{PROTOCOL_VERSION, ProtocolError};
