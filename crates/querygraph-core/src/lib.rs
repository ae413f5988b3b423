pub mod config;
pub mod error;
pub mod mapping;
pub mod session;
pub mod state;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use mapping::*;
pub use session::*;
pub use state::*;
pub use traits::*;
pub use types::*;
