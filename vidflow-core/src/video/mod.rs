pub mod error;
pub mod models;
pub mod store;

pub use error::{VideoError, VideoResult};
pub use models::{
    generate_short_code, generate_slug, slugify, FinalizedMedia, NewVideo, SourceType, VideoAsset,
    VideoFilter, VideoStatus,
};
pub use store::{SqliteVideoStore, SqliteVideoStoreBuilder};
