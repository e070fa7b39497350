pub mod mem;
pub mod models;
pub mod oid;
pub mod store;

pub use mem::MemStore;
pub use models::{File, FileKind, Outcome, Project, ResultRecord, Submission};
pub use oid::Oid;
pub use store::{Store, StoreError};
