//! Markdown generator.
//!
//! A markdown post starts with a header line, followed by the body:
//!
//! ```text
//! Hello world | 2012-12-01 | rust, notes
//! # Heading
//!
//! Body text with ![a picture](img/cover.png).
//! ```
//!
//! The header holds the title, the date (`YYYY-MM-DD`) and an optional
//! comma-separated tag list, separated by `|`. The key is the SHA-256 of the
//! trimmed header line. Relative image links are rewritten to
//! `/images/<key>/<link>` and collected into the entry's static list.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use pulldown_cmark::{html, Event, Options, Parser, Tag};

use crate::error::GenerateError;
use crate::generator::Generator;
use crate::key;
use crate::models::EntryMeta;
use crate::statics::StaticResolver;

/// Date format of the header line.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Separator between header fields.
pub const HEADER_SEPARATOR: char = '|';

/// URL prefix for rewritten image links.
pub const IMAGE_PREFIX: &str = "/images/";

/// Generator for `*.md` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownGenerator;

impl MarkdownGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for MarkdownGenerator {
    fn name(&self) -> &str {
        "markdown"
    }

    fn matches(&self, filename: &str) -> bool {
        filename.ends_with(".md")
    }

    async fn generate(
        &self,
        input: &[u8],
        _statics: &dyn StaticResolver,
    ) -> Result<EntryMeta, GenerateError> {
        let text = std::str::from_utf8(input)?;
        let (header, body) = text.split_once('\n').ok_or(GenerateError::MissingHeader)?;
        let header = header.trim();
        let (title, date, tags) = parse_header(header)?;

        let key = key::from_content(header.as_bytes());
        let (content, static_list) = render(body.trim(), &key);

        Ok(EntryMeta {
            key,
            title,
            date,
            content,
            tags,
            is_slide: false,
            static_list,
        })
    }
}

/// Split `title | date | tags` into its parts.
fn parse_header(
    header: &str,
) -> Result<(String, chrono::DateTime<Utc>, Vec<String>), GenerateError> {
    let mut fields = header.splitn(3, HEADER_SEPARATOR);
    let (Some(title), Some(date)) = (fields.next(), fields.next()) else {
        return Err(GenerateError::MalformedHeader(header.to_string()));
    };
    let tags = fields.next().map(split_tags).unwrap_or_default();

    let date = date.trim();
    let day = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|source| {
        GenerateError::InvalidDate {
            value: date.to_string(),
            source,
        }
    })?;
    let date = Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));

    Ok((title.trim().to_string(), date, tags))
}

/// Comma-separated tags, trimmed, empty items dropped.
pub(crate) fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether an image link points into the entry's own source.
pub(crate) fn is_relative_link(link: &str) -> bool {
    !(link.starts_with("http://") || link.starts_with("https://"))
}

/// Public URL for a resource of the entry `key`.
pub(crate) fn image_link(key: &str, link: &str) -> String {
    format!("{IMAGE_PREFIX}{key}/{}", link.trim_start_matches('/'))
}

/// Render markdown to HTML, rewriting relative image links.
///
/// Returns the HTML and the original relative links in document order.
pub(crate) fn render(markdown: &str, key: &str) -> (String, Vec<String>) {
    if markdown.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_SMART_PUNCTUATION);

    let mut statics = Vec::new();
    let events = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) if is_relative_link(&dest_url) => {
            statics.push(dest_url.to_string());
            Event::Start(Tag::Image {
                link_type,
                dest_url: image_link(key, &dest_url).into(),
                title,
                id,
            })
        }
        other => other,
    });

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, events);
    (out, statics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statics::NoStatics;

    async fn generate(text: &str) -> Result<EntryMeta, GenerateError> {
        MarkdownGenerator.generate(text.as_bytes(), &NoStatics).await
    }

    #[tokio::test]
    async fn parses_header_tags_and_body() {
        let meta = generate("hello world | 2012-12-01 |tag1, tag2\n# title hello world \n")
            .await
            .unwrap();
        assert_eq!(meta.title, "hello world");
        assert_eq!(meta.date.format(DATE_FORMAT).to_string(), "2012-12-01");
        assert_eq!(meta.tags, vec!["tag1", "tag2"]);
        assert_eq!(meta.content, "<h1>title hello world</h1>\n");
        assert!(!meta.is_slide);
        assert_eq!(
            meta.key,
            key::from_content(b"hello world | 2012-12-01 |tag1, tag2")
        );
    }

    #[tokio::test]
    async fn empty_body_and_tags() {
        let meta = generate("hello world | 2012-12-01 | \n ").await.unwrap();
        assert_eq!(meta.content, "");
        assert!(meta.tags.is_empty());
    }

    #[tokio::test]
    async fn header_without_tags_is_accepted() {
        let meta = generate("Plain | 2020-02-29\nbody").await.unwrap();
        assert_eq!(meta.title, "Plain");
        assert!(meta.tags.is_empty());
        assert_eq!(meta.content, "<p>body</p>\n");
    }

    #[tokio::test]
    async fn single_line_is_rejected() {
        let err = generate(" hello world | 2012-12-01 | tag1").await.unwrap_err();
        assert!(matches!(err, GenerateError::MissingHeader));
    }

    #[tokio::test]
    async fn missing_separator_is_rejected() {
        let err = generate(" hello world & 2012-12-01\n").await.unwrap_err();
        assert!(matches!(err, GenerateError::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn bad_date_is_rejected() {
        let err = generate(" hello world || 2012-12-01\n").await.unwrap_err();
        assert!(matches!(err, GenerateError::InvalidDate { .. }));
        assert!(err.to_string().starts_with("parsing time"));
    }

    #[tokio::test]
    async fn relative_images_are_rewritten_and_listed() {
        let text = "Pics | 2021-05-01\n\
                    ![a](img/a.png) ![b](https://example.com/b.png) ![c](c.jpg)\n";
        let meta = generate(text).await.unwrap();
        assert_eq!(meta.static_list, vec!["img/a.png", "c.jpg"]);
        assert!(meta
            .content
            .contains(&format!("src=\"/images/{}/img/a.png\"", meta.key)));
        assert!(meta.content.contains("src=\"https://example.com/b.png\""));
    }

    #[tokio::test]
    async fn generation_is_deterministic() {
        let text = "Same | 2021-05-01 | x\nbody ![p](p.png)\n";
        assert_eq!(generate(text).await.unwrap(), generate(text).await.unwrap());
    }
}
