pub mod markdown;
pub mod news;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// Platform ceiling for images in a single newspic post.
pub const MAX_IMAGE_POST_IMAGES: usize = 20;

pub const NEWSPIC_ARTICLE_TYPE: &str = "newspic";

/// One image-post invocation. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePostRequest {
    pub title: String,
    pub content: String,
    pub images: Vec<PathBuf>,
    pub from_markdown: Option<PathBuf>,
    pub open_comment: bool,
    pub fans_only: bool,
}

impl ImagePostRequest {
    /// Explicit images first, then the Markdown source's local images.
    pub fn resolve_images(&self) -> Vec<PathBuf> {
        let mut images = self.images.clone();
        if let Some(markdown_path) = self.from_markdown.as_deref() {
            images.extend(markdown::extract_local_images(markdown_path));
        }
        images
    }

    pub fn validate_title(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle);
        }
        Ok(())
    }
}

pub fn validate_image_count(count: usize) -> Result<(), ValidationError> {
    if count == 0 {
        return Err(ValidationError::NoImages);
    }
    if count > MAX_IMAGE_POST_IMAGES {
        return Err(ValidationError::TooManyImages {
            count,
            max: MAX_IMAGE_POST_IMAGES,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub source_path: PathBuf,
    pub media_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftResult {
    pub media_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub draft_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePostResult {
    pub media_id: String,
    pub draft_url: String,
    pub image_count: usize,
    pub uploaded_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewImage {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePostPreview {
    pub title: String,
    pub content: String,
    pub image_count: usize,
    pub images: Vec<PreviewImage>,
    pub open_comment: bool,
    pub fans_only: bool,
}

/// WeChat comment flags. `fans_only` only takes effect with comments open;
/// fans-only on a closed post is accepted and ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommentSettings {
    pub need_open_comment: u8,
    pub only_fans_can_comment: u8,
}

impl CommentSettings {
    pub fn new(open_comment: bool, fans_only: bool) -> Self {
        if !open_comment {
            return Self::default();
        }
        Self {
            need_open_comment: 1,
            only_fans_can_comment: u8::from(fans_only),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewspicImageItem {
    pub image_media_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewspicImageInfo {
    pub image_list: Vec<NewspicImageItem>,
}

/// Draft payload for an image-only ("newspic") post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewspicArticle {
    pub title: String,
    pub content: String,
    pub article_type: String,
    #[serde(flatten)]
    pub comments: CommentSettings,
    pub image_info: NewspicImageInfo,
}

impl NewspicArticle {
    pub fn assemble(request: &ImagePostRequest, uploaded: &[UploadedImage]) -> Self {
        Self {
            title: request.title.clone(),
            content: request.content.clone(),
            article_type: NEWSPIC_ARTICLE_TYPE.to_string(),
            comments: CommentSettings::new(request.open_comment, request.fans_only),
            image_info: NewspicImageInfo {
                image_list: uploaded
                    .iter()
                    .map(|image| NewspicImageItem {
                        image_media_id: image.media_id.clone(),
                    })
                    .collect(),
            },
        }
    }
}
