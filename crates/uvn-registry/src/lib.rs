pub mod deploy;
pub mod error;
pub mod model;
pub mod packager;
pub mod registry;
pub mod render;
pub mod versioned;
pub mod wgkeys;

pub use deploy::{Deployment, DeploymentStrategy, P2pLinksMap, StrategyInput, StrategyKind};
pub use error::{RegistryError, Result};
pub use model::{Cell, DeploymentSettings, Particle, User, Uvn, UvnSettings, VpnSettings};
pub use registry::{CellConfig, Registry};
pub use render::TemplateRenderer;
pub use versioned::{Revision, Versioned};
pub use wgkeys::VpnKeyStore;
