//! Media URL matching.
//!
//! Decides whether a request looks like it references a media asset, either
//! because it is served from a known media host or because the URL itself
//! carries a media extension or a known download endpoint.

use http::Uri;
use once_cell::sync::Lazy;
use regex::RegexSet;

/// Hosts that only ever serve media.
pub const MEDIA_HOSTS: &[&str] = &[
    // WeChat Channels
    "finder.video.qq.com",
    "findermp.video.qq.com",
    "szvideo.weixin.qq.com",
    "szextshort.weixin.qq.com",
    "channels.weixin.qq.com",
    "wxapp.tc.qq.com",
    "vweixinf.tc.qq.com",
];

/// Parent domains whose subdomains are all media CDNs.
pub const MEDIA_PARENT_DOMAINS: &[&str] = &[
    "video.qq.com",
    "tc.qq.com",
    "douyinvod.com",
    "bilivideo.com",
    "bilivideo.cn",
    "googlevideo.com",
];

/// Case-insensitive URL patterns for media files and download endpoints.
const MEDIA_URL_PATTERNS: &[&str] = &[
    r"(?i)\.(mp4|m3u8|flv|f4v|mov|webm|m4v|mkv|ts|m4s)(?:$|[?#])",
    r"(?i)getfindervideo",
    r"(?i)stodownload",
    r"(?i)/finder/",
    r"(?i)videoplayback",
];

static MEDIA_URL_SET: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(MEDIA_URL_PATTERNS).expect("Invalid media URL patterns"));

/// Checks whether a host belongs to a known media-serving domain.
///
/// Accepts an optional `:port` suffix and ignores case.
///
/// # Examples
///
/// ```
/// use vidcap_core::is_likely_media_domain;
///
/// assert!(is_likely_media_domain("finder.video.qq.com"));
/// assert!(is_likely_media_domain("upos-sz.bilivideo.com:443"));
/// assert!(!is_likely_media_domain("example.com"));
/// ```
pub fn is_likely_media_domain(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }

    if MEDIA_HOSTS.contains(&host.as_str()) {
        return true;
    }

    MEDIA_PARENT_DOMAINS
        .iter()
        .any(|parent| host == *parent || host.ends_with(&format!(".{}", parent)))
}

/// Checks whether a URL looks like a media file or download endpoint.
pub fn is_likely_media_url(url: &str) -> bool {
    MEDIA_URL_SET.is_match(url)
}

/// Returns true if the URL should be recorded as a media asset.
pub fn is_capturable(url: &str) -> bool {
    if is_likely_media_url(url) {
        return true;
    }
    host_of(url).is_some_and(|host| is_likely_media_domain(&host))
}

/// Extracts the host part of an absolute URL.
pub fn host_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.host().map(|h| h.to_string())
}
