//! Volume manager core: COW cloning, UID/GID namespace remapping, and
//! streaming import/export for filesystem-subtree volumes.

pub mod backend;
pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod model;
pub mod namespace;
pub mod registry;
pub mod stream;
pub mod translate;
pub mod walk;

pub use backend::{NaiveCopyBackend, VolumeBackend};
pub use catalog::Catalog;
pub use concurrency::CancelToken;
pub use config::IdentityRange;
pub use errors::{VolmanError, VolmanResult};
pub use identity::IdentityOracle;
pub use manager::{CreateStrategy, VolumeManager};
pub use model::{Flavor, Handle, Status, Strategy, Volume};
pub use registry::VolumeRegistry;
pub use translate::Direction;
