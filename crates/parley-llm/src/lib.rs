pub mod converter;
pub mod mock;
pub mod provider;
pub mod sse;

pub use mock::{MockModelClient, MockResponse};
pub use provider::{ClientConfig, OpenAiCompatClient};
