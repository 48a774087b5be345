//! Captured media asset records.

use chrono::Utc;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Content type used when the request carries none.
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Quality label used when the URL carries no resolution marker.
pub const UNKNOWN_QUALITY: &str = "未知";

/// Query parameters checked, in order, for a human-readable title.
const TITLE_PARAMS: &[&str] = &["title", "name", "desc", "description"];

/// URL substrings mapped to quality labels, checked in order.
const QUALITY_MARKERS: &[(&str, &str)] = &[
    ("2160", "4K"),
    ("4k", "4K"),
    ("1440", "1440P"),
    ("1080", "1080P"),
    ("720", "720P"),
    ("480", "480P"),
    ("360", "360P"),
];

/// A media asset observed in proxied traffic.
///
/// Records are immutable once created. The `id` is derived from the URL only,
/// so repeat sightings of the same URL map to the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedAsset {
    /// Hash of `url`.
    pub id: String,
    /// Full request URL as observed.
    pub url: String,
    /// Best-effort display title.
    pub title: String,
    /// Best-effort quality label.
    pub quality: String,
    /// Size in bytes, 0 if unknown.
    pub size: u64,
    /// Capture time in Unix milliseconds.
    pub timestamp_ms: i64,
    /// MIME type from the observed headers.
    pub content_type: String,
}

impl CapturedAsset {
    /// Builds a record for `url` captured now.
    pub fn new(url: impl Into<String>, headers: &HeaderMap) -> Self {
        Self::with_timestamp(url, headers, Utc::now().timestamp_millis())
    }

    /// Builds a record for `url` with an explicit capture time.
    pub fn with_timestamp(url: impl Into<String>, headers: &HeaderMap, timestamp_ms: i64) -> Self {
        let url = url.into();

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        Self {
            id: url_hash(&url),
            title: infer_title(&url, timestamp_ms),
            quality: infer_quality(&url),
            url,
            size,
            timestamp_ms,
            content_type,
        }
    }

    /// Returns a file name suitable for saving this asset.
    pub fn file_name(&self) -> String {
        let stem: String = self
            .title
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let stem = stem.trim();
        let stem = if stem.is_empty() { self.id.as_str() } else { stem };

        format!("{}.{}", stem, self.extension())
    }

    fn extension(&self) -> &str {
        match self.content_type.split(';').next().unwrap_or("").trim() {
            "video/webm" => "webm",
            "video/x-flv" => "flv",
            "video/quicktime" => "mov",
            "application/vnd.apple.mpegurl" | "application/x-mpegurl" => "m3u8",
            "video/mp2t" => "ts",
            _ => "mp4",
        }
    }
}

/// Hashes a URL into a stable record id.
///
/// A 32-bit rolling hash (`h * 31 + c` over UTF-16 code units, wrapping),
/// rendered as eight lowercase hex digits.
pub fn url_hash(url: &str) -> String {
    let hash = url
        .encode_utf16()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(u32::from(c)));
    format!("{:08x}", hash)
}

/// Derives a display title from the URL.
///
/// Prefers the `title`, `name`, `desc` or `description` query parameter, then
/// the last path segment without its extension, then `视频_<timestamp>`.
pub fn infer_title(url: &str, timestamp_ms: i64) -> String {
    if let Ok(parsed) = Url::parse(url) {
        for key in TITLE_PARAMS {
            let value = parsed
                .query_pairs()
                .find(|(k, v)| k == key && !v.trim().is_empty())
                .map(|(_, v)| v.trim().to_string());
            if let Some(value) = value {
                return value;
            }
        }

        let segment = parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned());

        if let Some(segment) = segment {
            let stem = match segment.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem,
                _ => segment.as_str(),
            };
            if !stem.trim().is_empty() {
                return stem.trim().to_string();
            }
        }
    }

    format!("视频_{}", timestamp_ms)
}

/// Derives a quality label from resolution markers in the URL path and query.
///
/// The host and port are ignored, so `127.0.0.1:37201` never reads as `720P`.
pub fn infer_quality(url: &str) -> String {
    let lower = match Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
    .to_ascii_lowercase();
    QUALITY_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| UNKNOWN_QUALITY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const FINDER_URL: &str = "https://szvideo.weixin.qq.com/xyz/getfindervideo?title=Demo";

    #[test]
    fn finder_url_with_title_param() {
        let asset = CapturedAsset::new(FINDER_URL, &HeaderMap::new());

        assert_eq!(asset.title, "Demo");
        assert_eq!(asset.quality, UNKNOWN_QUALITY);
        assert_eq!(asset.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(asset.size, 0);
        assert_eq!(asset.id, url_hash(FINDER_URL));
        assert_eq!(asset.url, FINDER_URL);
    }

    #[test]
    fn hash_is_stable_and_distinct() {
        assert_eq!(url_hash(FINDER_URL), url_hash(FINDER_URL));
        assert_ne!(url_hash(FINDER_URL), url_hash("http://example.com/a.mp4"));
        assert_eq!(url_hash(""), "00000000");
        // "a" == 97
        assert_eq!(url_hash("a"), "00000061");
        assert_eq!(url_hash(FINDER_URL).len(), 8);
    }

    #[test]
    fn title_params_in_priority_order() {
        assert_eq!(infer_title("http://x.com/v.mp4?desc=D&name=N", 1), "N");
        assert_eq!(infer_title("http://x.com/v.mp4?description=Long%20text", 1), "Long text");
        assert_eq!(infer_title("http://x.com/v.mp4?title=&name=Fallback", 1), "Fallback");
        assert_eq!(infer_title("http://x.com/v.mp4?title=%E4%BD%A0%E5%A5%BD", 1), "你好");
    }

    #[test]
    fn title_from_path_segment() {
        assert_eq!(infer_title("http://x.com/media/holiday.clip.mp4", 1), "holiday.clip");
        assert_eq!(infer_title("http://x.com/a/getfindervideo", 1), "getfindervideo");
        assert_eq!(infer_title("http://x.com/a/my%20video.mp4/", 1), "my video");
    }

    #[test]
    fn title_placeholder() {
        assert_eq!(infer_title("http://x.com/", 1700000000000), "视频_1700000000000");
        assert_eq!(infer_title("not a url", 42), "视频_42");
    }

    #[test]
    fn quality_markers() {
        assert_eq!(infer_quality("http://x.com/v_1080p.mp4"), "1080P");
        assert_eq!(infer_quality("http://x.com/v.mp4?res=720"), "720P");
        assert_eq!(infer_quality("http://x.com/4K/v.mp4"), "4K");
        assert_eq!(infer_quality("http://x.com/v.mp4"), UNKNOWN_QUALITY);
    }

    #[test]
    fn quality_ignores_host_and_port() {
        assert_eq!(infer_quality("http://127.0.0.1:37201/a.mp4"), UNKNOWN_QUALITY);
        assert_eq!(infer_quality("http://cdn1080.example.com/a.mp4"), UNKNOWN_QUALITY);
        assert_eq!(infer_quality("http://127.0.0.1:37201/a_480p.mp4"), "480P");
    }

    #[test]
    fn headers_fill_content_type_and_size() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/webm"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));

        let asset = CapturedAsset::with_timestamp("http://x.com/clip.webm", &headers, 5);
        assert_eq!(asset.content_type, "video/webm");
        assert_eq!(asset.size, 2048);
        assert_eq!(asset.timestamp_ms, 5);
        assert_eq!(asset.file_name(), "clip.webm");
    }

    #[test]
    fn file_name_is_sanitized() {
        let asset = CapturedAsset::with_timestamp(
            "http://x.com/v.mp4?title=a/b:c",
            &HeaderMap::new(),
            1,
        );
        assert_eq!(asset.file_name(), "a_b_c.mp4");
    }

    #[test]
    fn serializes_camel_case() {
        let asset = CapturedAsset::with_timestamp(FINDER_URL, &HeaderMap::new(), 7);
        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(json["timestampMs"], 7);
        assert_eq!(json["contentType"], DEFAULT_CONTENT_TYPE);
    }
}
