use anyhow::{Result, Context};
use regex::RegexSet;

/// URL fragments that mark site chrome rather than content. Matched against
/// the lowercased URL; separators keep short words from firing inside longer
/// ones (`ad-` must not hit `download`).
const BUILTIN: &[(&str, &str)] = &[
    ("logo", r"logo"),
    ("icon", r"favicon|(?:^|[/_.-])icons?(?:[/_.-]|$)"),
    ("sprite", r"sprite"),
    ("button", r"button"),
    ("banner", r"banner"),
    ("advert", r"(?:^|[/_.-])ads?[/_-]"),
    ("placeholder", r"placeholder|spinner|(?:^|[/_.-])(?:loading|blank|default)[/_.-]"),
    ("site_chrome", r"(?:^|[/_.-])(?:nav|menu|header|footer|sidebar|arrow)s?(?:[/_.-]|$)"),
    ("cover_art", r"(?:album|cd|single)[-_]?cover|track[-_]?art"),
    ("tracking", r"(?:^|[/.])(?:pixel|beacon|analytics|tracking)[/.]"),
    ("tiny_size", r"(?:^|[/_-])(?:16|24|32|48|64|96|128)(?:x(?:16|24|32|48|64|96|128))?(?:[/_.-]|$)"),
];

#[derive(Debug, Clone)]
pub struct DenyPatterns {
    names: Vec<String>,
    set: RegexSet,
}

impl DenyPatterns {
    pub fn builtin() -> Result<Self> {
        Self::with_extra(&[])
    }

    /// Built-in patterns plus caller-supplied regexes; each extra pattern is
    /// reported under its own source text.
    pub fn with_extra(extra: &[String]) -> Result<Self> {
        let mut names: Vec<String> = BUILTIN.iter().map(|(name, _)| name.to_string()).collect();
        let mut sources: Vec<String> = BUILTIN.iter().map(|(_, re)| re.to_string()).collect();
        for pattern in extra {
            names.push(pattern.clone());
            sources.push(pattern.to_lowercase());
        }
        let set = RegexSet::new(&sources).context("Invalid deny pattern")?;
        Ok(Self { names, set })
    }

    /// Name of the first pattern the URL hits, if any.
    pub fn first_match(&self, url: &str) -> Option<&str> {
        let lowered = url.to_lowercase();
        self.set
            .matches(&lowered)
            .iter()
            .next()
            .map(|i| self.names[i].as_str())
    }

    pub fn pattern_count(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_urls_are_attributed() -> Result<()> {
        let deny = DenyPatterns::builtin()?;
        assert_eq!(deny.first_match("https://site.com/static/Logo-Main.png"), Some("logo"));
        assert_eq!(deny.first_match("https://site.com/favicon.ico"), Some("icon"));
        assert_eq!(deny.first_match("https://site.com/img/ads/slot1.jpg"), Some("advert"));
        assert_eq!(deny.first_match("https://cdn.site.com/a/64x64/face.jpg"), Some("tiny_size"));
        assert_eq!(deny.first_match("https://site.com/album-cover/1.jpg"), Some("cover_art"));
        Ok(())
    }

    #[test]
    fn content_urls_pass() -> Result<()> {
        let deny = DenyPatterns::builtin()?;
        for url in [
            "https://upload.wikimedia.org/wikipedia/commons/a/ab/Portrait_2019.jpg",
            "https://site.com/downloads/photo_1200x800.jpg",
            "https://news.example.com/2023/05/headline-photo.jpeg",
            "https://site.com/media/lexicon/interview.webp",
        ] {
            assert_eq!(deny.first_match(url), None, "{}", url);
        }
        Ok(())
    }

    #[test]
    fn extra_patterns_report_their_source() -> Result<()> {
        let deny = DenyPatterns::with_extra(&["watermark".to_string()])?;
        assert_eq!(deny.first_match("https://a.com/WaterMark/1.jpg"), Some("watermark"));
        assert!(DenyPatterns::with_extra(&["(".to_string()]).is_err());
        Ok(())
    }
}
