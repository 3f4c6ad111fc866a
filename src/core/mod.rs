pub mod endpoint;
pub mod envelope;
pub mod frame;
pub mod reconnect;
pub mod types;

pub use endpoint::*;
pub use envelope::*;
pub use frame::*;
pub use reconnect::*;
pub use types::*;
