pub mod mock;
pub mod provider;
pub mod reliable;

pub use mock::{MockDecision, MockProvider};
pub use provider::{HttpProvider, HttpProviderConfig};
pub use reliable::{ReliableConfig, ReliableProvider};
