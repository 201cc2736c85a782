//! Importable image archive
//!
//! Produces the legacy `docker save` format, which `docker load` accepts:
//! one directory per layer named by its legacy ID, the image config,
//! `manifest.json` and `repositories`.

pub mod assembler;
pub mod manifest;

pub use assembler::ArchiveAssembler;
pub use manifest::{plan_layers, ArchiveConfig, LayerPlan, ManifestEntry};
