//! Regular ("news") articles loaded from a JSON draft file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// `{"articles": [...]}`, the same envelope the draft API accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsDraft {
    #[serde(default)]
    pub articles: Vec<NewsArticle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsArticle {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_source_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumb_media_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub show_cover_pic: u8,
}

fn is_zero(value: &u8) -> bool {
    *value == 0
}

impl NewsDraft {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read file: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse json: {}", path.display()))
    }

    /// Non-empty, and every article carries a title and content.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.articles.is_empty() {
            return Err(ValidationError::NoArticles);
        }
        for (offset, article) in self.articles.iter().enumerate() {
            let index = offset + 1;
            if article.title.trim().is_empty() {
                return Err(ValidationError::MissingArticleField {
                    index,
                    field: "title",
                });
            }
            if article.content.trim().is_empty() {
                return Err(ValidationError::MissingArticleField {
                    index,
                    field: "content",
                });
            }
        }
        Ok(())
    }

    /// The payload sent to the draft API. A cover flag without a cover image
    /// is dropped.
    pub fn normalized(&self) -> Self {
        let articles = self
            .articles
            .iter()
            .map(|article| {
                let mut article = article.clone();
                if article.thumb_media_id.is_empty() {
                    article.show_cover_pic = 0;
                }
                article
            })
            .collect();
        Self { articles }
    }
}
