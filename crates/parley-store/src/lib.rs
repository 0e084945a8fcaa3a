pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod store;
pub mod title;

pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRow;
pub use sessions::SessionRow;
pub use store::{RecordedTurn, SessionDetail, SessionPage, SessionStore};
pub use title::{title_from_first_message, DEFAULT_TITLE, DEFAULT_TOPIC};
