//! The TileDB storage core: array schemas, tiles, fragments, and the
//! storage manager that persists logical cells in a tiled, append-only
//! on-disk layout and serves range queries against it.

pub mod cancel;
pub mod cell;
pub mod config;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod hilbert;
pub mod schema;
pub mod sm;
pub mod tile;

pub use cancel::CancelToken;
pub use config::Config;
pub use error::{Error, Result};
pub use schema::ArraySchema;
pub use sm::{ArrayDescriptor, FragmentDescriptor, StorageManager};
pub use tile::Tile;
