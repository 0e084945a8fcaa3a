pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod security;
pub mod stream;
pub mod text;
