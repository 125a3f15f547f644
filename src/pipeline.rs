//! The request pipeline: lookup, resolve, render, cache, serve.
//!
//! [`Pipeline::handle`] runs one request through a fixed sequence of
//! stages, each an explicit early return:
//!
//! 1. Parse and validate the request.
//! 2. Request-cache lookup — a hit serves bytes without touching the
//!    resolver or the codec.
//! 3. Identify the source and resolve dimensions.
//! 4. Source passthrough — a request that changes nothing serves the
//!    original bytes and caches nothing.
//! 5. Rendered-cache lookup by content key.
//! 6. Render: decode, resample, crop, grayscale, background, encode.
//! 7. Write both cache namespaces and maybe kick off a garbage sweep.

use crate::cache::{self, CacheStore, RenditionIdentity, StorageError};
use crate::codec::{
    self, CodecError, EncodeOptions, ImageCodec, OutputFormat, SourceFormat, SourceInfo,
};
use crate::config::ProxyConfig;
use crate::crop;
use crate::gc::{self, GarbageCollector, SweepStats};
use crate::request::{RequestError, RequestIdentity, TransformRequest};
use crate::resolve::{RenderPlan, resolve_render, sharpening_factor};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Coarse classification for the transport layer's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is at fault (4xx).
    Client,
    /// The requested image does not exist (404).
    NotFound,
    /// The proxy failed (5xx).
    Server,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Request(RequestError::ImageNotFound(_)) => ErrorClass::NotFound,
            Self::Request(_) => ErrorClass::Client,
            // A source we cannot decode is the client's problem; failing
            // to read it is ours.
            Self::Codec(CodecError::Io(_)) => ErrorClass::Server,
            Self::Codec(_) => ErrorClass::Client,
            Self::Storage(_) => ErrorClass::Server,
        }
    }
}

/// Where a response's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The unmodified source file.
    Source,
    /// The request-identity namespace.
    RequestCache,
    /// The content-identity namespace.
    RenderedCache,
    /// Rendered just now.
    Rendered,
}

impl CacheStatus {
    /// Value for a diagnostic response header.
    pub fn label(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::RequestCache => "request-cache",
            Self::RenderedCache => "rendered-cache",
            Self::Rendered => "rendered",
        }
    }
}

/// One finished response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub status: CacheStatus,
}

pub struct Pipeline<C: ImageCodec> {
    config: ProxyConfig,
    codec: C,
    store: CacheStore,
    collector: GarbageCollector,
}

impl<C: ImageCodec> Pipeline<C> {
    pub fn new(config: ProxyConfig, codec: C) -> Self {
        let store = CacheStore::new(&config);
        let collector = GarbageCollector::new(&config);
        Self {
            config,
            codec,
            store,
            collector,
        }
    }

    /// Serve one request.
    pub fn handle(&self, identity: &RequestIdentity) -> Result<Rendition, PipelineError> {
        let request = TransformRequest::from_uri(&identity.uri, &self.config)?;

        let source_path = self.absolute_source_path(&request);
        let source_mtime = source_modified(&source_path)?;

        // A request that fell back to the default image must not be pinned
        // in the request cache, or the real image would stay masked after
        // it appears.
        let request_cacheable = self.config.cache.request_cache && !request.using_default_path;
        let request_key = cache::request_key(
            &identity.host,
            &identity.uri,
            self.config.rendering.cropper,
        );

        if request_cacheable
            && let Some(hit) = self.store.fetch_request(&request_key, source_mtime)?
            && let Some(mime) = codec::sniff_mime(&hit.bytes)
        {
            debug!("request cache hit for {}", identity.uri);
            self.maybe_sweep();
            return Ok(Rendition {
                bytes: hit.bytes,
                mime,
                status: CacheStatus::RequestCache,
            });
        }

        let info = self.codec.identify(&source_path)?;
        let plan = resolve_render(
            (info.width, info.height),
            request.width,
            request.height,
            request.crop.map(|c| c.ratio),
        );

        if serves_source(&request, &info, &plan) {
            let bytes = fs::read(&source_path).map_err(StorageError::Io)?;
            self.maybe_sweep();
            return Ok(Rendition {
                bytes,
                mime: info.format.mime(),
                status: CacheStatus::Source,
            });
        }

        let cropper = request.cropper.unwrap_or(self.config.rendering.cropper);
        let quality = request.quality.unwrap_or(self.config.rendering.quality);
        let output = info.format.output();
        // Progressive encoding only exists for JPEG; normalize it out of the
        // identity for other outputs so p0 and p1 share one rendition.
        let progressive = output == OutputFormat::Jpeg
            && request
                .progressive
                .unwrap_or(self.config.rendering.progressive);

        let content_key = cache::content_key(&RenditionIdentity {
            source_path: &source_path,
            width: plan.width,
            height: plan.height,
            crop: plan.crop,
            cropper,
            quality,
            mime: output.mime(),
            progressive,
            background: request.background.as_deref(),
            grayscale: request.grayscale,
        });

        if let Some(bytes) = self.store.fetch_rendered(&content_key, source_mtime)? {
            debug!("rendered cache hit for {}", identity.uri);
            if request_cacheable && !self.store.request_path(&request_key).exists() {
                self.store.store_request(&request_key, &content_key)?;
            }
            self.maybe_sweep();
            return Ok(Rendition {
                bytes,
                mime: output.mime(),
                status: CacheStatus::RenderedCache,
            });
        }

        let decoded = self.codec.decode(&source_path)?;

        // Only lossy sources benefit from compensating sharpening
        let sharpening = if info.format == SourceFormat::Jpeg {
            let (final_w, final_h) = plan.final_dimensions();
            sharpening_factor(
                u64::from(info.width) * u64::from(info.height),
                u64::from(final_w) * u64::from(final_h),
            )
        } else {
            0
        };

        let mut buffer = self
            .codec
            .resample(&decoded, plan.width, plan.height, sharpening);

        if let Some((crop_w, crop_h)) = plan.crop {
            let (x, y) = crop::compute_offset(cropper, &buffer, (crop_w, crop_h));
            buffer = codec::crop_region(&buffer, x, y, crop_w, crop_h);
        }

        if request.grayscale {
            codec::grayscale_in_place(&mut buffer);
        }

        if let Some(color) = &request.background
            && output.supports_transparency()
        {
            codec::flatten_background(&mut buffer, color);
        }

        let bytes = self.codec.encode(
            &buffer,
            output,
            &EncodeOptions {
                quality,
                progressive,
            },
        )?;

        self.store.store_rendered(&content_key, &bytes)?;
        if request_cacheable {
            self.store.store_request(&request_key, &content_key)?;
        }

        self.maybe_sweep();
        Ok(Rendition {
            bytes,
            mime: output.mime(),
            status: CacheStatus::Rendered,
        })
    }

    /// Run a cache sweep now, regardless of the probabilistic trigger.
    pub fn run_garbage_collection(&self) -> io::Result<Option<SweepStats>> {
        self.collector.sweep()
    }

    /// Post-response sweep, off-thread so the response is never delayed.
    fn maybe_sweep(&self) {
        if !gc::should_sweep(&self.config.gc) {
            return;
        }
        let collector = self.collector.clone();
        thread::spawn(move || {
            if let Err(err) = collector.sweep() {
                warn!("garbage collection failed: {err}");
            }
        });
    }

    fn absolute_source_path(&self, request: &TransformRequest) -> PathBuf {
        let joined = self.config.full_source_path(&request.path);
        fs::canonicalize(&joined).unwrap_or(joined)
    }
}

fn source_modified(path: &std::path::Path) -> Result<SystemTime, PipelineError> {
    let mtime = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(StorageError::Io)?;
    Ok(mtime)
}

/// True when rendering would change nothing and the source can go out as-is.
fn serves_source(request: &TransformRequest, info: &SourceInfo, plan: &RenderPlan) -> bool {
    plan.width == info.width
        && plan.height == info.height
        && plan.crop.is_none()
        && request.quality.is_none()
        && request.background.is_none()
        && !request.grayscale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{RecordedOp, RecordingCodec};
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    /// Pipeline over a temp source tree with the probabilistic sweep off.
    fn pipeline_with_images(files: &[(&str, u32, u32)]) -> (TempDir, Pipeline<RecordingCodec>) {
        let tmp = TempDir::new().unwrap();
        let source_root = tmp.path().join("images");
        std::fs::create_dir_all(&source_root).unwrap();
        for (name, width, height) in files {
            let image = RgbaImage::from_fn(*width, *height, |x, y| {
                Rgba([(x % 256) as u8, (y % 256) as u8, 120, 255])
            });
            image.save(source_root.join(name)).unwrap();
        }
        let mut config = ProxyConfig {
            source_root,
            cache_dir: tmp.path().join("cache"),
            ..ProxyConfig::default()
        };
        config.gc.probability = 0;
        (tmp, Pipeline::new(config, RecordingCodec::new()))
    }

    fn request(uri: &str) -> RequestIdentity {
        RequestIdentity::new("img.example", uri)
    }

    fn decoded_dimensions(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).unwrap().to_rgba8().dimensions()
    }

    // =========================================================================
    // Rendering and cache status
    // =========================================================================

    #[test]
    fn first_request_renders() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 100)]);
        let rendition = pipeline.handle(&request("w50/cat.png")).unwrap();
        assert_eq!(rendition.status, CacheStatus::Rendered);
        assert_eq!(rendition.mime, "image/png");
        assert_eq!(decoded_dimensions(&rendition.bytes), (50, 50));
    }

    #[test]
    fn repeat_request_hits_request_cache_without_codec_work() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 100)]);
        let first = pipeline.handle(&request("w50/cat.png")).unwrap();

        pipeline.codec.operations.lock().unwrap().clear();
        let second = pipeline.handle(&request("w50/cat.png")).unwrap();

        assert_eq!(second.status, CacheStatus::RequestCache);
        assert_eq!(second.bytes, first.bytes);
        assert!(
            pipeline.codec.get_operations().is_empty(),
            "a request cache hit must not touch the codec"
        );
    }

    #[test]
    fn unconstraining_request_serves_source_untouched() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 100)]);
        let rendition = pipeline.handle(&request("w400-h400/cat.png")).unwrap();

        assert_eq!(rendition.status, CacheStatus::Source);
        assert_eq!(decoded_dimensions(&rendition.bytes), (100, 100));
        // Nothing decoded, nothing cached
        let ops = pipeline.codec.get_operations();
        assert!(ops.iter().all(|op| matches!(op, RecordedOp::Identify(_))));
        assert!(
            std::fs::read_dir(pipeline.store.rendered_dir())
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        );
    }

    #[test]
    fn grayscale_forces_a_render_even_at_full_size() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 100)]);
        let rendition = pipeline.handle(&request("g1/cat.png")).unwrap();
        assert_eq!(rendition.status, CacheStatus::Rendered);
    }

    #[test]
    fn rendered_cache_hit_recreates_missing_request_record() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 100)]);
        pipeline.handle(&request("w50/cat.png")).unwrap();

        let key = cache::request_key(
            "img.example",
            "w50/cat.png",
            pipeline.config.rendering.cropper,
        );
        std::fs::remove_file(pipeline.store.request_path(&key)).unwrap();

        let rendition = pipeline.handle(&request("w50/cat.png")).unwrap();
        assert_eq!(rendition.status, CacheStatus::RenderedCache);
        assert!(pipeline.store.request_path(&key).exists());
    }

    #[test]
    fn equivalent_uris_share_a_rendition_but_not_a_request_entry() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 100, 200)]);
        // Same crop ratio spelled differently: distinct request keys, one
        // content key.
        pipeline.handle(&request("w50-c1.1/cat.png")).unwrap();
        let second = pipeline.handle(&request("w50-c1:1/cat.png")).unwrap();
        assert_eq!(second.status, CacheStatus::RenderedCache);
    }

    // =========================================================================
    // Default image handling
    // =========================================================================

    #[test]
    fn default_image_fallback_is_not_request_cached() {
        let (_tmp, mut pipeline) = pipeline_with_images(&[("missing.png", 40, 40)]);
        pipeline.config.default_image = Some("/missing.png".into());

        let rendition = pipeline.handle(&request("w20/gone.png")).unwrap();
        assert_eq!(rendition.status, CacheStatus::Rendered);
        assert!(
            std::fs::read_dir(pipeline.store.request_dir())
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true),
            "fallback responses must not pin the missing path"
        );
    }

    // =========================================================================
    // Error classification
    // =========================================================================

    #[test]
    fn missing_image_classifies_as_not_found() {
        let (_tmp, pipeline) = pipeline_with_images(&[]);
        let err = pipeline.handle(&request("w50/gone.png")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn invalid_parameters_classify_as_client_error() {
        let (_tmp, pipeline) = pipeline_with_images(&[("cat.png", 10, 10)]);
        let err = pipeline.handle(&request("w0/cat.png")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Client);
    }

    #[test]
    fn undecodable_source_classifies_as_client_error() {
        let (tmp, pipeline) = pipeline_with_images(&[]);
        std::fs::write(tmp.path().join("images/fake.dat"), b"not an image").unwrap();
        let err = pipeline.handle(&request("w50/fake.dat")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Client);
    }

    #[test]
    fn storage_failures_classify_as_server_error() {
        let err = PipelineError::Storage(StorageError::Io(std::io::Error::other("disk gone")));
        assert_eq!(err.class(), ErrorClass::Server);
    }
}
