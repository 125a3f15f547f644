//! # reframe
//!
//! An on-demand image transformation proxy. Given a source image and a
//! compact parameter string — `w300-h300-c1.1.smart/photos/cat.jpg` — it
//! produces a resized, cropped, recompressed variant and caches it so the
//! next identical request costs a file read.
//!
//! # Architecture: One Pipeline, Two Caches
//!
//! Every request runs through a fixed sequence of stages, bailing out as
//! early as it can:
//!
//! ```text
//! parse → request cache? → identify → passthrough? → rendered cache? → render
//! ```
//!
//! The cache has two flat namespaces:
//!
//! - `rendered/` is keyed by the fully resolved rendering parameters, so two
//!   different URLs that mean the same rendition share one entry.
//! - `request/` is keyed by the raw request identity and holds tiny records
//!   pointing into `rendered/`, so repeat requests skip dimension resolution
//!   entirely while disk usage stays proportional to distinct renditions.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `reframe.toml` loading, defaults, validation |
//! | [`request`] | Parameter mini-language parsing and eager validation |
//! | [`resolve`] | Pure dimension/crop arithmetic and the sharpening curve |
//! | [`crop`] | Crop placement strategies: centered, top-centered, smart |
//! | [`codec`] | The `ImageCodec` seam, RGBA transforms, `image`-crate codec |
//! | [`cache`] | SHA-256 cache keys and the two-namespace store |
//! | [`gc`] | Probabilistic, lock-guarded cache sweeps |
//! | [`pipeline`] | The orchestrator: [`pipeline::Pipeline::handle`] |
//!
//! # Design Decisions
//!
//! ## Indirection Records Instead of Symlinks
//!
//! The request namespace stores the content key as file data rather than
//! symlinking to the rendition. This works on every filesystem, keeps the
//! space properties of links, and makes a dangling reference a plain
//! existence check during garbage collection.
//!
//! ## Static Cropper Registry
//!
//! The cropper named in a URL selects a [`crop::CropperKind`] variant.
//! A fixed enum — not dynamic lookup — so an attacker-controlled URL can
//! only ever choose between the three built-in strategies.
//!
//! ## Pure-Rust Imaging
//!
//! Decoding and encoding go through the `image` crate: no ImageMagick, no
//! GD, no system packages. The binary is self-contained, and the codec sits
//! behind the [`codec::ImageCodec`] trait so tests can observe or replace it.
//!
//! ## Legacy URL Compatibility
//!
//! The parameter mini-language keeps its historical loose coercions
//! (`"100.9"` truncates, `"false"` is truthy) so existing image URLs keep
//! resolving to the same renditions. See [`request`] for the exact rules.

pub mod cache;
pub mod codec;
pub mod config;
pub mod crop;
pub mod gc;
pub mod pipeline;
pub mod request;
pub mod resolve;
