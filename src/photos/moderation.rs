/// Automated image moderation
///
/// A moderator returns the highest unsafe-content probability it finds, or
/// `None` when it cannot decide. Undecided photos go to manual review.
use crate::config::ModerationConfig;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Deserialize;

#[async_trait]
pub trait ImageModerator: Send + Sync {
    async fn score(&self, image: &[u8], content_type: &str) -> Option<f64>;
}

/// Moderator used when no provider is configured
pub struct ManualReviewOnly;

#[async_trait]
impl ImageModerator for ManualReviewOnly {
    async fn score(&self, _image: &[u8], _content_type: &str) -> Option<f64> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct SightEngineResponse {
    status: String,
    #[serde(default)]
    nudity: Option<NudityScores>,
    #[serde(default)]
    offensive: Option<OffensiveScores>,
}

#[derive(Debug, Deserialize)]
struct NudityScores {
    #[serde(default)]
    sexual_activity: Option<f64>,
    #[serde(default)]
    sexual_display: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OffensiveScores {
    #[serde(default)]
    prob: Option<f64>,
}

impl SightEngineResponse {
    fn score(&self) -> Option<f64> {
        if self.status != "success" {
            return None;
        }
        let nudity = self
            .nudity
            .as_ref()
            .map(|n| {
                n.sexual_activity
                    .unwrap_or(0.0)
                    .max(n.sexual_display.unwrap_or(0.0))
            })
            .unwrap_or(0.0);
        let offensive = self
            .offensive
            .as_ref()
            .and_then(|o| o.prob)
            .unwrap_or(0.0);
        Some(nudity.max(offensive))
    }
}

/// SightEngine `check.json` client
pub struct SightEngineModerator {
    client: reqwest::Client,
    config: ModerationConfig,
}

impl SightEngineModerator {
    /// `None` when credentials are missing
    pub fn from_config(config: &ModerationConfig) -> Option<Self> {
        if config.api_user.is_none() || config.api_secret.is_none() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| tracing::error!("Failed to build moderation client: {}", e))
            .ok()?;

        Some(Self {
            client,
            config: config.clone(),
        })
    }

    async fn request(&self, image: &[u8], content_type: &str) -> Result<f64, String> {
        let api_user = self.config.api_user.clone().unwrap_or_default();
        let api_secret = self
            .config
            .api_secret
            .as_ref()
            .map(|s| s.expose_secret().to_string())
            .unwrap_or_default();

        let media = Part::bytes(image.to_vec())
            .file_name(format!("photo.{}", super::extension_for(content_type)))
            .mime_str(content_type)
            .map_err(|e| e.to_string())?;

        let form = Form::new()
            .part("media", media)
            .text("models", "nudity,offensive")
            .text("api_user", api_user)
            .text("api_secret", api_secret);

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        let body: SightEngineResponse = response.json().await.map_err(|e| e.to_string())?;
        body.score()
            .ok_or_else(|| format!("provider status {}", body.status))
    }
}

#[async_trait]
impl ImageModerator for SightEngineModerator {
    async fn score(&self, image: &[u8], content_type: &str) -> Option<f64> {
        match self.request(image, content_type).await {
            Ok(score) => Some(score),
            Err(e) => {
                tracing::warn!("Moderation check failed, deferring photo to manual review: {}", e);
                None
            }
        }
    }
}
