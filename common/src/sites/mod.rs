// Built-in site modules

pub mod example;
pub mod http;

pub use example::ExampleSite;
pub use http::{HttpPageSite, HttpSiteConfig};
