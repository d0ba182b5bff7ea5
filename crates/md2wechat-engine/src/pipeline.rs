use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use md2wechat_contracts::errors::{ImagePostError, PublishError, UploadError};
use md2wechat_contracts::events::{EventKind, EventLog, EventPayload};
use md2wechat_contracts::posts::{
    validate_image_count, DraftResult, ImagePostPreview, ImagePostRequest, ImagePostResult,
    NewspicArticle, PreviewImage, UploadedImage,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{error_chain_text, mask_media_id};

/// Attempts per image before the whole post is abandoned.
pub const UPLOAD_MAX_ATTEMPTS: u32 = 3;

/// Remote side of an image post: the material library and the draft box.
pub trait MaterialPublisher {
    /// One upload attempt; returns the permanent media id.
    fn upload_material(&self, path: &Path) -> Result<String>;
    fn create_newspic_draft(&self, article: &NewspicArticle) -> Result<DraftResult>;
}

/// Stand-in for dry runs, where credentials may be absent. Never reached by
/// [`ImagePostPipeline::preview`]; any call is an error.
pub struct DryRunPublisher;

impl MaterialPublisher for DryRunPublisher {
    fn upload_material(&self, path: &Path) -> Result<String> {
        bail!("dry run: upload of {} skipped", path.display())
    }

    fn create_newspic_draft(&self, _article: &NewspicArticle) -> Result<DraftResult> {
        bail!("dry run: draft creation skipped")
    }
}

/// Validate, resolve, upload and publish one image post.
///
/// Uploads are sequential and in resolved order. The first image that
/// exhausts its attempts aborts the run before any draft is created; media
/// already uploaded stays in the library and is reported on the error.
pub struct ImagePostPipeline<'a, P: MaterialPublisher + ?Sized> {
    publisher: &'a P,
    events: EventLog,
    max_attempts: u32,
}

impl<'a, P: MaterialPublisher + ?Sized> ImagePostPipeline<'a, P> {
    pub fn new(publisher: &'a P) -> Self {
        Self {
            publisher,
            events: EventLog::disabled(),
            max_attempts: UPLOAD_MAX_ATTEMPTS,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Dry run: same validation as [`Self::run`], no remote calls.
    pub fn preview(&self, request: &ImagePostRequest) -> Result<ImagePostPreview, ImagePostError> {
        let images = self.validate(request)?;
        Ok(ImagePostPreview {
            title: request.title.clone(),
            content: request.content.clone(),
            image_count: images.len(),
            images: images.iter().map(|path| probe_image(path)).collect(),
            open_comment: request.open_comment,
            fans_only: request.fans_only,
        })
    }

    pub fn run(&self, request: &ImagePostRequest) -> Result<ImagePostResult, ImagePostError> {
        let images = self.validate(request)?;
        let total = images.len();
        self.emit(
            EventKind::RunStarted,
            json!({ "title": request.title, "image_count": total }),
        );

        let mut uploaded: Vec<UploadedImage> = Vec::with_capacity(total);
        for (offset, path) in images.iter().enumerate() {
            let index = offset + 1;
            info!(index, total, path = %path.display(), "uploading image");
            match self.upload_with_retry(index, path) {
                Ok(media_id) => {
                    info!(index, total, media_id = %mask_media_id(&media_id), "image uploaded");
                    self.emit(
                        EventKind::ImageUploaded,
                        json!({
                            "index": index,
                            "path": path.to_string_lossy(),
                            "media_id": mask_media_id(&media_id),
                        }),
                    );
                    uploaded.push(UploadedImage {
                        source_path: path.clone(),
                        media_id,
                    });
                }
                Err(err) => {
                    let err = UploadError {
                        index,
                        path: path.clone(),
                        attempts: self.max_attempts,
                        message: error_chain_text(&err, 512),
                        uploaded_media_ids: media_ids(&uploaded),
                    };
                    self.emit_failure(&err.to_string());
                    return Err(err.into());
                }
            }
        }

        let article = NewspicArticle::assemble(request, &uploaded);
        let draft = match self.publisher.create_newspic_draft(&article) {
            Ok(draft) => draft,
            Err(err) => {
                let err = PublishError {
                    message: error_chain_text(&err, 512),
                    uploaded_media_ids: media_ids(&uploaded),
                };
                self.emit_failure(&err.to_string());
                return Err(err.into());
            }
        };
        info!(media_id = %mask_media_id(&draft.media_id), image_count = total, "draft created");
        self.emit(
            EventKind::DraftCreated,
            json!({
                "media_id": mask_media_id(&draft.media_id),
                "image_count": total,
            }),
        );

        Ok(ImagePostResult {
            media_id: draft.media_id,
            draft_url: draft.draft_url,
            image_count: total,
            uploaded_ids: media_ids(&uploaded),
        })
    }

    /// Title first, then the resolved list's bounds.
    fn validate(&self, request: &ImagePostRequest) -> Result<Vec<PathBuf>, ImagePostError> {
        request.validate_title()?;
        let images = request.resolve_images();
        for (offset, path) in images.iter().enumerate() {
            self.emit(
                EventKind::ImageResolved,
                json!({ "index": offset + 1, "path": path.to_string_lossy() }),
            );
        }
        validate_image_count(images.len())?;
        Ok(images)
    }

    fn upload_with_retry(&self, index: usize, path: &Path) -> Result<String> {
        let mut attempt = 1;
        loop {
            match self.publisher.upload_material(path) {
                Ok(media_id) => return Ok(media_id),
                Err(err) => {
                    let reason = error_chain_text(&err, 512);
                    warn!(index, attempt, max_attempts = self.max_attempts, error = %reason, "upload attempt failed");
                    self.emit(
                        EventKind::UploadAttemptFailed,
                        json!({
                            "index": index,
                            "path": path.to_string_lossy(),
                            "attempt": attempt,
                            "error": reason,
                        }),
                    );
                    if attempt >= self.max_attempts {
                        return Err(err.context(format!(
                            "upload failed after {attempt} attempts"
                        )));
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn emit_failure(&self, error: &str) {
        self.emit(EventKind::RunFailed, json!({ "error": error }));
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = self.events.emit(kind, payload) {
            warn!(event = kind.as_str(), error = %err, "failed to write event");
        }
    }
}

fn media_ids(uploaded: &[UploadedImage]) -> Vec<String> {
    uploaded.iter().map(|image| image.media_id.clone()).collect()
}

/// Existence, byte size and pixel dimensions for a dry-run listing.
pub fn probe_image(path: &Path) -> PreviewImage {
    let Ok(metadata) = fs::metadata(path) else {
        return PreviewImage {
            path: path.to_path_buf(),
            exists: false,
            size: None,
            width: None,
            height: None,
        };
    };
    let (width, height) = match image::image_dimensions(path) {
        Ok((width, height)) => (Some(width), Some(height)),
        Err(_) => (None, None),
    };
    PreviewImage {
        path: path.to_path_buf(),
        exists: true,
        size: Some(metadata.len()),
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use anyhow::bail;
    use image::{Rgb, RgbImage};
    use md2wechat_contracts::errors::{ImagePostError, ValidationError};
    use md2wechat_contracts::events::EventLog;
    use md2wechat_contracts::posts::{DraftResult, ImagePostRequest, NewspicArticle};
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct FakePublisher {
        /// Paths whose every upload attempt fails.
        failing: BTreeSet<PathBuf>,
        /// Paths that fail once and then succeed.
        flaky: BTreeSet<PathBuf>,
        fail_draft: bool,
        uploads: Mutex<Vec<PathBuf>>,
        drafts: Mutex<Vec<NewspicArticle>>,
    }

    impl FakePublisher {
        fn upload_calls(&self) -> Vec<PathBuf> {
            self.uploads.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn draft_calls(&self) -> Vec<NewspicArticle> {
            self.drafts.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    impl MaterialPublisher for FakePublisher {
        fn upload_material(&self, path: &Path) -> anyhow::Result<String> {
            let mut calls = self
                .uploads
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?;
            let previous = calls.iter().filter(|call| call.as_path() == path).count();
            calls.push(path.to_path_buf());
            if self.failing.contains(path) {
                bail!("connection reset");
            }
            if self.flaky.contains(path) && previous == 0 {
                bail!("timeout");
            }
            let name = path
                .file_stem()
                .and_then(|value| value.to_str())
                .unwrap_or("x");
            Ok(format!("media-{name}"))
        }

        fn create_newspic_draft(&self, article: &NewspicArticle) -> anyhow::Result<DraftResult> {
            self.drafts
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(article.clone());
            if self.fail_draft {
                bail!("WeChat API error 45009: reach max api daily quota limit");
            }
            Ok(DraftResult {
                media_id: "draft-001".to_string(),
                draft_url: "https://mp.weixin.qq.com/".to_string(),
            })
        }
    }

    fn paths(count: usize) -> Vec<PathBuf> {
        (1..=count)
            .map(|idx| PathBuf::from(format!("/photos/img{idx}.png")))
            .collect()
    }

    fn request_with(images: Vec<PathBuf>) -> ImagePostRequest {
        ImagePostRequest {
            title: "Weekend".to_string(),
            content: "hiking".to_string(),
            images,
            ..ImagePostRequest::default()
        }
    }

    #[test]
    fn uploads_in_order_and_publishes_once() -> anyhow::Result<()> {
        let publisher = FakePublisher::default();
        let images = paths(3);
        let result = ImagePostPipeline::new(&publisher).run(&request_with(images.clone()))?;

        assert_eq!(result.media_id, "draft-001");
        assert_eq!(result.image_count, 3);
        assert_eq!(
            result.uploaded_ids,
            vec!["media-img1", "media-img2", "media-img3"]
        );
        assert_eq!(publisher.upload_calls(), images);

        let drafts = publisher.draft_calls();
        assert_eq!(drafts.len(), 1);
        let ids: Vec<&str> = drafts[0]
            .image_info
            .image_list
            .iter()
            .map(|item| item.image_media_id.as_str())
            .collect();
        assert_eq!(ids, vec!["media-img1", "media-img2", "media-img3"]);
        assert_eq!(drafts[0].article_type, "newspic");
        Ok(())
    }

    #[test]
    fn transient_failure_is_retried() -> anyhow::Result<()> {
        let images = paths(2);
        let publisher = FakePublisher {
            flaky: BTreeSet::from([images[1].clone()]),
            ..FakePublisher::default()
        };
        let result = ImagePostPipeline::new(&publisher).run(&request_with(images.clone()))?;
        assert_eq!(result.image_count, 2);
        assert_eq!(
            publisher.upload_calls(),
            vec![images[0].clone(), images[1].clone(), images[1].clone()]
        );
        Ok(())
    }

    #[test]
    fn exhausted_image_aborts_before_draft() {
        let images = paths(5);
        let publisher = FakePublisher {
            failing: BTreeSet::from([images[1].clone()]),
            ..FakePublisher::default()
        };
        let err = ImagePostPipeline::new(&publisher)
            .run(&request_with(images.clone()))
            .err();

        let upload = match err {
            Some(ImagePostError::Upload(upload)) => upload,
            other => panic!("expected upload error, got {other:?}"),
        };
        assert_eq!(upload.index, 2);
        assert_eq!(upload.path, images[1]);
        assert_eq!(upload.attempts, 3);
        assert_eq!(upload.uploaded_media_ids, vec!["media-img1"]);
        assert!(upload.message.contains("connection reset"));
        assert!(upload.to_string().starts_with("upload image 2 (/photos/img2.png)"));

        let calls = publisher.upload_calls();
        assert_eq!(calls.len(), 4);
        assert!(!calls.contains(&images[2]));
        assert!(publisher.draft_calls().is_empty());
    }

    #[test]
    fn attempt_budget_is_configurable() {
        let images = paths(1);
        let publisher = FakePublisher {
            failing: BTreeSet::from([images[0].clone()]),
            ..FakePublisher::default()
        };
        let err = ImagePostPipeline::new(&publisher)
            .with_max_attempts(5)
            .run(&request_with(images))
            .err();
        assert!(matches!(err, Some(ImagePostError::Upload(ref upload)) if upload.attempts == 5));
        assert_eq!(publisher.upload_calls().len(), 5);
    }

    #[test]
    fn draft_failure_reports_uploaded_media() {
        let publisher = FakePublisher {
            fail_draft: true,
            ..FakePublisher::default()
        };
        let err = ImagePostPipeline::new(&publisher)
            .run(&request_with(paths(2)))
            .err();
        let publish = match err {
            Some(ImagePostError::Publish(publish)) => publish,
            other => panic!("expected publish error, got {other:?}"),
        };
        assert!(publish.to_string().starts_with("create draft: "));
        assert!(publish.message.contains("45009"));
        assert_eq!(publish.uploaded_media_ids, vec!["media-img1", "media-img2"]);
    }

    #[test]
    fn validation_rejects_before_any_remote_call() {
        let publisher = FakePublisher::default();
        let pipeline = ImagePostPipeline::new(&publisher);

        let mut untitled = request_with(paths(1));
        untitled.title = "   ".to_string();
        let cases = [
            (untitled, ValidationError::MissingTitle),
            (request_with(Vec::new()), ValidationError::NoImages),
            (
                request_with(paths(21)),
                ValidationError::TooManyImages { count: 21, max: 20 },
            ),
        ];
        for (request, expected) in cases {
            assert_eq!(
                pipeline.run(&request).err(),
                Some(ImagePostError::Validation(expected.clone()))
            );
            assert_eq!(
                pipeline.preview(&request).err(),
                Some(ImagePostError::Validation(expected))
            );
        }
        assert!(publisher.upload_calls().is_empty());
        assert!(publisher.draft_calls().is_empty());
    }

    #[test]
    fn missing_title_wins_over_missing_images() {
        let publisher = FakePublisher::default();
        let request = ImagePostRequest::default();
        assert_eq!(
            ImagePostPipeline::new(&publisher).run(&request).err(),
            Some(ImagePostError::Validation(ValidationError::MissingTitle))
        );
    }

    #[test]
    fn twenty_images_are_accepted() -> anyhow::Result<()> {
        let publisher = FakePublisher::default();
        let result = ImagePostPipeline::new(&publisher).run(&request_with(paths(20)))?;
        assert_eq!(result.image_count, 20);
        Ok(())
    }

    #[test]
    fn markdown_images_follow_explicit_ones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let markdown = temp.path().join("post.md");
        fs::write(
            &markdown,
            "![a](pics/one.png)\n![remote](https://cdn.example/x.png)\n![b](two.jpg \"Two\")\n",
        )?;
        let publisher = FakePublisher::default();
        let mut request = request_with(vec![PathBuf::from("/photos/cover.png")]);
        request.from_markdown = Some(markdown);

        let result = ImagePostPipeline::new(&publisher).run(&request)?;
        assert_eq!(result.image_count, 3);
        let calls = publisher.upload_calls();
        assert_eq!(calls[0], PathBuf::from("/photos/cover.png"));
        assert!(calls[1].ends_with("pics/one.png"));
        assert!(calls[2].ends_with("two.jpg"));
        assert!(calls[1].is_absolute());
        Ok(())
    }

    #[test]
    fn preview_probes_files_without_remote_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let real = temp.path().join("real.png");
        RgbImage::from_pixel(4, 3, Rgb([200, 10, 10])).save(&real)?;
        let broken = temp.path().join("broken.png");
        fs::write(&broken, b"not an image")?;
        let missing = temp.path().join("missing.png");

        let publisher = FakePublisher::default();
        let mut request = request_with(vec![real.clone(), broken.clone(), missing.clone()]);
        request.open_comment = true;
        let preview = ImagePostPipeline::new(&publisher).preview(&request)?;

        assert_eq!(preview.image_count, 3);
        assert!(preview.open_comment);
        assert!(!preview.fans_only);
        assert_eq!(preview.images[0].path, real);
        assert!(preview.images[0].exists);
        assert_eq!(preview.images[0].width, Some(4));
        assert_eq!(preview.images[0].height, Some(3));
        assert!(preview.images[1].exists);
        assert_eq!(preview.images[1].size, Some(12));
        assert_eq!(preview.images[1].width, None);
        assert!(!preview.images[2].exists);
        assert_eq!(preview.images[2].size, None);

        assert!(publisher.upload_calls().is_empty());
        assert!(publisher.draft_calls().is_empty());
        Ok(())
    }

    #[test]
    fn dry_run_publisher_previews_but_never_publishes() -> anyhow::Result<()> {
        let pipeline = ImagePostPipeline::new(&DryRunPublisher).with_max_attempts(1);
        let request = request_with(paths(2));
        assert_eq!(pipeline.preview(&request)?.image_count, 2);
        assert!(matches!(
            pipeline.run(&request).err(),
            Some(ImagePostError::Upload(ref upload)) if upload.index == 1
        ));
        Ok(())
    }

    #[test]
    fn events_trace_retries_and_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let images = paths(2);
        let publisher = FakePublisher {
            failing: BTreeSet::from([images[1].clone()]),
            ..FakePublisher::default()
        };
        let result = ImagePostPipeline::new(&publisher)
            .with_events(EventLog::new(&events_path, "run-1"))
            .run(&request_with(images));
        assert!(result.is_err());

        let content = fs::read_to_string(&events_path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "image_resolved",
                "image_resolved",
                "run_started",
                "image_uploaded",
                "upload_attempt_failed",
                "upload_attempt_failed",
                "upload_attempt_failed",
                "run_failed",
            ]
        );
        Ok(())
    }
}
