//! Condition sampling: station telemetry plus the status-image pixel.
//!
//! One sample combines the hourly snowfall reading with the color of the
//! location's rendered status page, fetched as a 1×1 rendition of its
//! social-preview image. All failures here are transient: the engine logs
//! them and leaves the location's state untouched until the next tick.

use crate::amedas::{self, AmedasError};
use crate::color::Rgb;
use crate::config::Location;
use regex::Regex;
use std::future::Future;

/// One observation of a location's condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub color: Rgb,
    pub rainsnow: bool,
}

/// Transient sampling failures; retried naturally on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] AmedasError),
    #[error("Page fetch failed: {0}")]
    Page(String),
    #[error("Image fetch failed: {0}")]
    Image(String),
    #[error("Image decode failed: {0}")]
    Decode(String),
}

/// Source of condition samples.
///
/// The engine is generic over this seam so tests can script samples without
/// touching the network.
pub trait ConditionSource: Send + Sync {
    fn sample(
        &self,
        location: &Location,
    ) -> impl Future<Output = Result<Sample, SampleError>> + Send;
}

/// Production sampler backed by the telemetry provider and the status page.
pub struct WebSampler {
    client: reqwest::Client,
}

impl WebSampler {
    pub fn new(client: reqwest::Client) -> Self {
        WebSampler { client }
    }

    async fn fetch_page(&self, url: &str) -> Result<String, SampleError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SampleError::Page(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SampleError::Page(format!("{}: status {}", url, resp.status())));
        }
        resp.text().await.map_err(|e| SampleError::Page(e.to_string()))
    }

    async fn fetch_pixel(&self, url: &str) -> Result<Rgb, SampleError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SampleError::Image(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SampleError::Image(format!("{}: status {}", url, resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SampleError::Image(e.to_string()))?;
        decode_pixel(&bytes)
    }
}

impl ConditionSource for WebSampler {
    async fn sample(&self, location: &Location) -> Result<Sample, SampleError> {
        let bucket = amedas::telemetry_bucket(amedas::provider_now());
        let reading =
            amedas::fetch_snow_reading(&self.client, &location.station_id, &bucket).await?;
        let rainsnow = reading.is_some_and(|r| r.indicates_snowfall());

        let html = self
            .fetch_page(&variant_url(&location.page_url, rainsnow))
            .await?;

        let Some(image_url) = extract_og_image(&html) else {
            // No preview image on the page: "no data", not "clear".
            return Ok(Sample {
                color: Rgb::BLACK,
                rainsnow,
            });
        };

        let color = self.fetch_pixel(&thumbnail_url(&image_url)).await?;
        Ok(Sample { color, rainsnow })
    }
}

/// Page URL variant: a `rainsnow/` path segment is inserted before the
/// query string while precipitation telemetry is active.
pub fn variant_url(page_url: &str, rainsnow: bool) -> String {
    let segment = if rainsnow { "rainsnow/" } else { "" };
    match page_url.split_once('?') {
        Some((base, query)) => format!("{}{}?{}", base, segment, query),
        None => format!("{}{}", page_url, segment),
    }
}

/// Pull the social-preview image URL out of the page markup.
pub fn extract_og_image(html: &str) -> Option<String> {
    let tag = Regex::new(r#"<meta[^>]*property\s*=\s*["']og:image["'][^>]*>"#)
        .expect("static pattern")
        .find(html)?;
    let content = Regex::new(r#"content\s*=\s*["']([^"']+)["']"#)
        .expect("static pattern")
        .captures(tag.as_str())?;
    Some(content[1].to_string())
}

/// Rewrite the preview image URL to its 1×1 rendition.
pub fn thumbnail_url(image_url: &str) -> String {
    image_url.replace("1200x630", "1x1")
}

/// Decode the rendition and return its top-left pixel.
fn decode_pixel(bytes: &[u8]) -> Result<Rgb, SampleError> {
    let image = image::load_from_memory(bytes).map_err(|e| SampleError::Decode(e.to_string()))?;
    let pixel = image.to_rgb8().get_pixel(0, 0).0;
    Ok(Rgb::new(pixel[0], pixel[1], pixel[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_url_inserts_segment_before_query() {
        let url = "https://example.com/map/?lat=35.7&lon=139.75";
        assert_eq!(variant_url(url, false), url);
        assert_eq!(
            variant_url(url, true),
            "https://example.com/map/rainsnow/?lat=35.7&lon=139.75"
        );
    }

    #[test]
    fn variant_url_without_query() {
        assert_eq!(
            variant_url("https://example.com/map/", true),
            "https://example.com/map/rainsnow/"
        );
    }

    #[test]
    fn og_image_extracted() {
        let html = r#"<html><head>
            <meta property="og:title" content="Weather map">
            <meta property="og:image" content="https://img.example.com/map_1200x630.png">
            </head></html>"#;
        assert_eq!(
            extract_og_image(html).as_deref(),
            Some("https://img.example.com/map_1200x630.png")
        );
    }

    #[test]
    fn og_image_attribute_order_does_not_matter() {
        let html = r#"<meta content="https://img.example.com/a.png" property="og:image">"#;
        assert_eq!(
            extract_og_image(html).as_deref(),
            Some("https://img.example.com/a.png")
        );
    }

    #[test]
    fn og_image_absent() {
        assert_eq!(extract_og_image("<html><head></head></html>"), None);
        assert_eq!(
            extract_og_image(r#"<meta property="og:title" content="x">"#),
            None
        );
    }

    #[test]
    fn thumbnail_url_requests_single_pixel() {
        assert_eq!(
            thumbnail_url("https://img.example.com/map_1200x630.png"),
            "https://img.example.com/map_1x1.png"
        );
    }

    #[test]
    fn decode_pixel_reads_top_left() {
        let mut bytes = Vec::new();
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            1,
            1,
            image::Rgb([10, 20, 30]),
        ));
        image
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        assert_eq!(decode_pixel(&bytes).unwrap(), Rgb::new(10, 20, 30));
    }

    #[test]
    fn decode_pixel_rejects_garbage() {
        assert!(matches!(
            decode_pixel(b"not an image"),
            Err(SampleError::Decode(_))
        ));
    }
}
