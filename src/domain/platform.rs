use serde::{Deserialize, Serialize};
use url::Url;

/// Domains accepted into the share queue, matched case-insensitively anywhere in the URL.
pub const SUPPORTED_DOMAINS: [&str; 4] = ["instagram.com", "blog.naver.com", "youtube.com", "youtu.be"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
    NaverBlog,
    Youtube,
}

impl Platform {
    pub fn detect(raw_url: &str) -> Option<Self> {
        let lowered = raw_url.to_lowercase();
        let host = Url::parse(&lowered)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string));
        let haystack = host.as_deref().unwrap_or(lowered.as_str());

        if haystack.contains("instagram.com") {
            Some(Platform::Instagram)
        } else if haystack.contains("blog.naver.com") {
            Some(Platform::NaverBlog)
        } else if haystack.contains("youtube.com") || haystack.contains("youtu.be") {
            Some(Platform::Youtube)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Platform::Instagram => "Instagram",
            Platform::NaverBlog => "네이버 블로그",
            Platform::Youtube => "YouTube",
        }
    }
}

pub fn is_supported_url(raw_url: &str) -> bool {
    let lowered = raw_url.to_lowercase();
    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| lowered.contains(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_urls_match_case_insensitively() {
        assert!(is_supported_url("https://www.Instagram.com/p/Cxyz/"));
        assert!(is_supported_url("https://BLOG.naver.com/foodie/2233"));
        assert!(is_supported_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_supported_url("https://m.youtube.com/watch?v=1"));
        assert!(!is_supported_url("https://naver.com/news"));
        assert!(!is_supported_url("https://example.com"));
        assert!(!is_supported_url(""));
    }

    #[test]
    fn platform_is_detected_from_host() {
        assert_eq!(
            Platform::detect("https://www.instagram.com/reel/abc"),
            Some(Platform::Instagram)
        );
        assert_eq!(
            Platform::detect("https://blog.naver.com/someone/1"),
            Some(Platform::NaverBlog)
        );
        assert_eq!(Platform::detect("https://youtu.be/x"), Some(Platform::Youtube));
        assert_eq!(Platform::detect("https://example.com/?ref=youtube"), None);
    }
}
