// Site module registry: capability contract, builder and lookup

pub mod module;
pub mod site_registry;

pub use module::{SiteConfig, SiteConfigBuilder, SiteModule};
pub use site_registry::{RegisteredSite, SiteRegistry};
