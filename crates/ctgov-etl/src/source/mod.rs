//! Registry API source
//!
//! [`ClinicalTrialsClient`] fetches single pages from the v2 `studies`
//! endpoint and flattens them to [`StudyRecord`](crate::models::StudyRecord)s.
//! [`PaginatedReader`] drives the page-token protocol on top of any
//! [`StudySource`].

pub mod client;
pub mod flatten;
pub mod query;
pub mod reader;

pub use client::{ClinicalTrialsClient, StudyPage, StudySource};
pub use query::StudyQuery;
pub use reader::PaginatedReader;
