pub mod tag;

pub use tag::{StoredTag, TagReading};
