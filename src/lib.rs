//! docker-forensics - Docker image recovery from forensic disk images
//!
//! Rebuilds `docker load`-compatible image archives from the overlay2
//! store of a mounted, read-only host filesystem, without a Docker daemon:
//!
//! - Image metadata lookup by full or shortened ID
//! - Layer chain resolution through the layer database
//! - Layer tar extraction (byte-exact via tar-split where available)
//! - `docker save` archive assembly
//! - Best-effort Dockerfile reconstruction
//!
//! Nothing is ever written below the mount path.

pub mod archive;
pub mod config;
pub mod digest;
pub mod dockerfile;
pub mod error;
pub mod extract;
pub mod layer;
pub mod path;
pub mod pipeline;
pub mod report;
pub mod store;

pub use config::ExtractOptions;
pub use error::{ForensicsError, Result};
pub use pipeline::{extract_image, extract_images};
pub use report::{ReconstructionStatus, Summary};
