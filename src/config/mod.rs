mod settings;

pub use settings::{BackoffConfig, ClientConfig, Settings};
