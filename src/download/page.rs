use std::collections::HashSet;
use anyhow::{Result, Context};
use regex::Regex;
use url::Url;

/// Pulls candidate image URLs out of a source page's HTML.
pub struct ImageLinkExtractor {
    patterns: Vec<Regex>,
}

impl ImageLinkExtractor {
    pub fn new() -> Result<Self> {
        let sources = [
            r#"(?is)<img\b[^>]*?\b(?:data-src|src)\s*=\s*["']([^"']+)["']"#,
            r#"(?is)<meta\b[^>]*?property\s*=\s*["']og:image(?::url)?["'][^>]*?content\s*=\s*["']([^"']+)["']"#,
            r#"(?is)<meta\b[^>]*?content\s*=\s*["']([^"']+)["'][^>]*?property\s*=\s*["']og:image(?::url)?["']"#,
        ];
        let patterns = sources
            .iter()
            .map(|s| Regex::new(s))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid image link pattern")?;
        Ok(Self { patterns })
    }

    /// Absolute http(s) image URLs in document order (Open Graph images
    /// after inline ones), without repeats, at most `limit` of them.
    pub fn extract(&self, html: &str, page_url: &str, limit: usize) -> Vec<String> {
        let Ok(base) = Url::parse(page_url) else { return Vec::new() };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for pattern in &self.patterns {
            for caps in pattern.captures_iter(html) {
                if out.len() >= limit {
                    return out;
                }
                let raw = caps[1].trim().replace("&amp;", "&");
                let Ok(resolved) = base.join(&raw) else { continue };
                if !matches!(resolved.scheme(), "http" | "https") {
                    continue;
                }
                let resolved = resolved.to_string();
                if seen.insert(resolved.clone()) {
                    out.push(resolved);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
          <meta property="og:image" content="https://cdn.example.com/og/portrait.jpg">
        </head><body>
          <img class="hero" src="/media/photo1.jpg" alt="x">
          <IMG data-src='photos/photo2.png?w=800&amp;h=600'>
          <img src="data:image/gif;base64,R0lGODlhAQABAAAAACw=">
          <img src="/media/photo1.jpg">
          <img src="https://cdn.example.com/og/portrait.jpg">
        </body></html>"#;

    #[test]
    fn resolves_dedupes_and_keeps_order() -> Result<()> {
        let urls = ImageLinkExtractor::new()?.extract(PAGE, "https://www.example.com/artists/abc", 40);
        assert_eq!(
            urls,
            vec![
                "https://www.example.com/media/photo1.jpg",
                "https://www.example.com/artists/photos/photo2.png?w=800&h=600",
                "https://cdn.example.com/og/portrait.jpg",
            ]
        );
        Ok(())
    }

    #[test]
    fn respects_limit_and_bad_base() -> Result<()> {
        let extractor = ImageLinkExtractor::new()?;
        assert_eq!(extractor.extract(PAGE, "https://www.example.com/", 1).len(), 1);
        assert!(extractor.extract(PAGE, "not a url", 40).is_empty());
        Ok(())
    }
}
