//! Article and slide generator for the `present` document format.
//!
//! ```text
//! Title
//! Subtitle
//! 2 Jan 2006
//! Tags: foo, bar
//!
//! Author Name
//!
//! * First section
//!
//! Some text.
//!
//! - a bullet
//! - another bullet
//!
//! ** Subsection
//!
//! .code hello.rs
//! .image img/diagram.png 300 400
//! ```
//!
//! The header block runs up to the first blank line: the title, then an
//! optional subtitle, date line and `Tags:` line in any order. Lines after it
//! and before the first `*` heading name the presenter. Sections open with
//! one to three `*`. Indented lines are preformatted, `- ` lines are bullets,
//! and dot commands (`.code`, `.play`, `.html`, `.image`, `.iframe`,
//! `.link`) embed resources. `.code`, `.play` and `.html` are read through
//! the entry's [`StaticResolver`] while generating; an unreadable resource is
//! logged and replaced with an empty block.
//!
//! The key is derived from the title; relative `.image` links are rewritten
//! to `/images/<key>/<link>` and collected into the static list.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::error::GenerateError;
use crate::generator::Generator;
use crate::key;
use crate::markdown::{image_link, is_relative_link, split_tags};
use crate::models::EntryMeta;
use crate::statics::StaticResolver;

/// Date layouts accepted on the header date line, tried in order.
const DATE_TIME_FORMATS: &[&str] = &["%H:%M %d %b %Y"];
const DATE_FORMATS: &[&str] = &["%d %b %Y", "%d %B %Y", "%Y-%m-%d"];

/// Which flavour of document a [`PresentGenerator`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentKind {
    /// `*.article`: a single flowing page.
    Article,
    /// `*.slide`: one `<article>` per top-level section.
    Slide,
}

/// Generator for `*.article` and `*.slide` files.
#[derive(Debug, Clone, Copy)]
pub struct PresentGenerator {
    kind: PresentKind,
}

impl PresentGenerator {
    pub fn article() -> Self {
        Self {
            kind: PresentKind::Article,
        }
    }

    pub fn slide() -> Self {
        Self {
            kind: PresentKind::Slide,
        }
    }

    pub fn kind(&self) -> PresentKind {
        self.kind
    }

    fn extension(&self) -> &'static str {
        match self.kind {
            PresentKind::Article => ".article",
            PresentKind::Slide => ".slide",
        }
    }
}

#[async_trait]
impl Generator for PresentGenerator {
    fn name(&self) -> &str {
        match self.kind {
            PresentKind::Article => "article",
            PresentKind::Slide => "slide",
        }
    }

    fn matches(&self, filename: &str) -> bool {
        filename.ends_with(self.extension())
    }

    async fn generate(
        &self,
        input: &[u8],
        statics: &dyn StaticResolver,
    ) -> Result<EntryMeta, GenerateError> {
        let text = std::str::from_utf8(input)?;
        let doc = parse(text, statics).await?;
        let key = key::from_title(&doc.title);

        let mut static_list = Vec::new();
        let content = match self.kind {
            PresentKind::Article => render_article(&doc, &key, &mut static_list),
            PresentKind::Slide => render_slides(&doc, &key, &mut static_list),
        };

        Ok(EntryMeta {
            key,
            title: doc.title,
            date: doc.date,
            content,
            tags: doc.tags,
            is_slide: self.kind == PresentKind::Slide,
            static_list,
        })
    }
}

// ============ Document model ============

#[derive(Debug, Default)]
struct Doc {
    title: String,
    subtitle: String,
    date: DateTime<Utc>,
    tags: Vec<String>,
    authors: Vec<String>,
    sections: Vec<Section>,
}

#[derive(Debug, Default)]
struct Section {
    number: Vec<usize>,
    title: String,
    elems: Vec<Elem>,
}

impl Section {
    fn formatted_number(&self) -> String {
        let mut out = String::new();
        for n in &self.number {
            out.push_str(&n.to_string());
            out.push('.');
        }
        out
    }

    fn level(&self) -> usize {
        self.number.len()
    }
}

#[derive(Debug)]
enum Elem {
    Text(Vec<String>),
    Pre(Vec<String>),
    List(Vec<String>),
    Section(Section),
    Code { lines: Vec<String>, play: bool },
    Image { url: String, size: Option<(String, String)> },
    Iframe { url: String, size: Option<(String, String)> },
    Link { url: String, label: String },
    Html(String),
}

// ============ Parsing ============

fn parse_date(line: &str) -> Option<DateTime<Utc>> {
    for format in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(line, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(day) = NaiveDate::parse_from_str(line, format) {
            return Some(Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)));
        }
    }
    None
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let stars = line.bytes().take_while(|b| *b == b'*').count();
    if (1..=3).contains(&stars) && line[stars..].starts_with(' ') {
        Some((stars, line[stars..].trim()))
    } else {
        None
    }
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#')
}

/// Optional trailing `height width` pair of an `.image`/`.iframe` command.
fn size_args(args: &[&str]) -> Option<(String, String)> {
    match args {
        [h, w, ..] => Some((h.to_string(), w.to_string())),
        _ => None,
    }
}

async fn read_static(statics: &dyn StaticResolver, path: &str) -> Option<String> {
    match statics.open(path).await.read_all().await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(path = %path, error = %e, "failed to read embedded resource");
            None
        }
    }
}

/// Collects sections as they open and close while lines stream past.
#[derive(Default)]
struct Outline {
    top: Vec<Section>,
    open: Vec<Section>,
}

impl Outline {
    fn close_to(&mut self, level: usize) {
        while self.open.len() > level {
            if let Some(done) = self.open.pop() {
                match self.open.last_mut() {
                    Some(parent) => parent.elems.push(Elem::Section(done)),
                    None => self.top.push(done),
                }
            }
        }
    }

    fn start(&mut self, level: usize, title: &str) {
        // A heading can only go one level deeper than the current section.
        let level = level.min(self.open.len() + 1);
        self.close_to(level - 1);

        let mut number = match self.open.last() {
            Some(parent) => parent.number.clone(),
            None => Vec::new(),
        };
        let siblings = match self.open.last() {
            Some(parent) => parent
                .elems
                .iter()
                .filter(|e| matches!(e, Elem::Section(_)))
                .count(),
            None => self.top.len(),
        };
        number.push(siblings + 1);
        self.open.push(Section {
            number,
            title: title.to_string(),
            elems: Vec::new(),
        });
    }

    fn push(&mut self, elem: Elem) {
        if self.open.is_empty() {
            self.start(1, "");
        }
        if let Some(current) = self.open.last_mut() {
            current.elems.push(elem);
        }
    }

    fn finish(mut self) -> Vec<Section> {
        self.close_to(0);
        self.top
    }
}

async fn parse(text: &str, statics: &dyn StaticResolver) -> Result<Doc, GenerateError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut doc = Doc::default();
    let mut i = 0;

    // Header block.
    while i < lines.len() && lines[i].trim().is_empty() {
        i += 1;
    }
    if i == lines.len() {
        return Err(GenerateError::MissingHeader);
    }
    doc.title = lines[i].trim().to_string();
    i += 1;
    while i < lines.len() && !lines[i].trim().is_empty() {
        let line = lines[i].trim();
        if let Some(tags) = line.strip_prefix("Tags:") {
            doc.tags = split_tags(tags);
        } else if let Some(date) = parse_date(line) {
            doc.date = date;
        } else if doc.subtitle.is_empty() {
            doc.subtitle = line.to_string();
        } else {
            return Err(GenerateError::MalformedHeader(line.to_string()));
        }
        i += 1;
    }

    // Presenter block, up to the first heading.
    while i < lines.len() && heading_level(lines[i]).is_none() {
        let line = lines[i].trim();
        if !line.is_empty() && !is_comment(line) {
            doc.authors.push(line.to_string());
        }
        i += 1;
    }

    let mut outline = Outline::default();
    while i < lines.len() {
        let raw = lines[i];
        let line = raw.trim_end();

        if line.trim().is_empty() || is_comment(line) {
            i += 1;
            continue;
        }

        if let Some((level, title)) = heading_level(line) {
            outline.start(level, title);
            i += 1;
            continue;
        }

        if raw.starts_with(' ') || raw.starts_with('\t') {
            let mut pre = Vec::new();
            let indented = |line: &str| {
                line.starts_with(' ') || line.starts_with('\t') || line.trim().is_empty()
            };
            while i < lines.len() && indented(lines[i]) {
                pre.push(lines[i].trim_end().to_string());
                i += 1;
            }
            while pre.last().is_some_and(|l| l.is_empty()) {
                pre.pop();
            }
            outline.push(Elem::Pre(dedent(&pre)));
            continue;
        }

        if line.starts_with("- ") {
            let mut items = Vec::new();
            while i < lines.len() {
                match lines[i].strip_prefix("- ") {
                    Some(item) => items.push(item.trim().to_string()),
                    None => break,
                }
                i += 1;
            }
            outline.push(Elem::List(items));
            continue;
        }

        if let Some(command) = line.strip_prefix('.') {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let args: Vec<&str> = parts.collect();
            if let Some(elem) = parse_command(name, &args, statics).await {
                outline.push(elem);
            }
            i += 1;
            continue;
        }

        let mut text = Vec::new();
        let start = i;
        while i < lines.len() {
            let l = lines[i];
            if i > start
                && (l.trim().is_empty()
                    || l.starts_with(' ')
                    || l.starts_with('\t')
                    || l.starts_with("- ")
                    || l.starts_with('.')
                    || heading_level(l).is_some())
            {
                break;
            }
            if !is_comment(l) {
                text.push(l.trim_end().to_string());
            }
            i += 1;
        }
        outline.push(Elem::Text(text));
    }

    doc.sections = outline.finish();
    Ok(doc)
}

async fn parse_command(name: &str, args: &[&str], statics: &dyn StaticResolver) -> Option<Elem> {
    let first = args.first().copied();
    match (name, first) {
        ("code" | "play", Some(path)) => {
            let lines = match read_static(statics, path).await {
                Some(text) => text.lines().map(str::to_string).collect(),
                None => Vec::new(),
            };
            Some(Elem::Code {
                lines,
                play: name == "play",
            })
        }
        ("html", Some(path)) => Some(Elem::Html(
            read_static(statics, path).await.unwrap_or_default(),
        )),
        ("image", Some(url)) => Some(Elem::Image {
            url: url.to_string(),
            size: size_args(&args[1..]),
        }),
        ("iframe", Some(url)) => Some(Elem::Iframe {
            url: url.to_string(),
            size: size_args(&args[1..]),
        }),
        ("link", Some(url)) => {
            let label = if args.len() > 1 {
                args[1..].join(" ")
            } else {
                url.trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string()
            };
            Some(Elem::Link {
                url: url.to_string(),
                label,
            })
        }
        _ => {
            warn!(command = %name, "ignoring unknown or incomplete present command");
            None
        }
    }
}

/// Strip the common leading whitespace of a preformatted block.
fn dedent(lines: &[String]) -> Vec<String> {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or("").to_string())
        .collect()
}

// ============ Rendering ============

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn size_attrs(size: &Option<(String, String)>) -> String {
    match size {
        Some((h, w)) => format!(" height=\"{}\" width=\"{}\"", escape(h), escape(w)),
        None => String::new(),
    }
}

struct Renderer<'a> {
    key: &'a str,
    slide: bool,
    statics: &'a mut Vec<String>,
    out: String,
}

impl Renderer<'_> {
    fn elems(&mut self, elems: &[Elem]) {
        for elem in elems {
            self.elem(elem);
        }
    }

    fn elem(&mut self, elem: &Elem) {
        match elem {
            Elem::Text(lines) => {
                let body: Vec<String> = lines.iter().map(|l| escape(l)).collect();
                self.out.push_str(&format!("<p>\n{}\n</p>\n", body.join("\n")));
            }
            Elem::Pre(lines) => {
                let body: Vec<String> = lines.iter().map(|l| escape(l)).collect();
                self.out.push_str(&format!(
                    "<div class=\"code\"><pre>{}</pre></div>\n",
                    body.join("\n")
                ));
            }
            Elem::List(items) => {
                self.out.push_str("<ul>\n");
                for item in items {
                    self.out.push_str(&format!("<li>{}</li>\n", escape(item)));
                }
                self.out.push_str("</ul>\n");
            }
            Elem::Section(section) => {
                let tag = if self.slide {
                    if section.level() <= 2 { "h2" } else { "h3" }
                } else {
                    "h4"
                };
                let number = section.formatted_number();
                let label = if self.slide {
                    format!("{number} {}", escape(&section.title))
                } else {
                    escape(&section.title)
                };
                self.out
                    .push_str(&format!("<{tag} id=\"TOC_{number}\">{label}</{tag}>\n"));
                self.elems(&section.elems);
            }
            Elem::Code { lines, play } => {
                let class = match (play, self.slide) {
                    (true, true) => "code playground",
                    (true, false) => "playground",
                    (false, _) => "code",
                };
                self.out.push_str(&format!("<div class=\"{class}\"><pre>"));
                for (n, line) in lines.iter().enumerate() {
                    self.out
                        .push_str(&format!("<span num=\"{}\">{}</span>\n", n + 1, escape(line)));
                }
                self.out.push_str("</pre></div>\n");
            }
            Elem::Image { url, size } => {
                let src = if is_relative_link(url) {
                    self.statics.push(url.clone());
                    image_link(self.key, url)
                } else {
                    url.clone()
                };
                self.out.push_str(&format!(
                    "<div class=\"image\">\n<img src=\"{}\"{}>\n</div>\n",
                    escape(&src),
                    size_attrs(size)
                ));
            }
            Elem::Iframe { url, size } => {
                self.out.push_str(&format!(
                    "<div class=\"iframe\">\n\
                     <iframe src=\"{}\"{} frameborder=\"0\" allowfullscreen></iframe>\n\
                     </div>\n",
                    escape(url),
                    size_attrs(size)
                ));
            }
            Elem::Link { url, label } => {
                self.out.push_str(&format!(
                    "<p class=\"link\"><a href=\"{}\" target=\"_blank\">{}</a></p>\n",
                    escape(url),
                    escape(label)
                ));
            }
            Elem::Html(html) => self.out.push_str(html),
        }
    }
}

fn render_article(doc: &Doc, key: &str, statics: &mut Vec<String>) -> String {
    let mut r = Renderer {
        key,
        slide: false,
        statics,
        out: String::new(),
    };
    if !doc.subtitle.is_empty() {
        r.out.push_str(&format!("<h2>{}</h2>\n", escape(&doc.subtitle)));
    }
    match doc.sections.as_slice() {
        [only] => r.elems(&only.elems),
        sections => {
            for section in sections {
                r.elem(&Elem::Section(Section {
                    number: section.number.clone(),
                    title: section.title.clone(),
                    elems: Vec::new(),
                }));
                r.elems(&section.elems);
            }
        }
    }
    r.out
}

fn render_slides(doc: &Doc, key: &str, statics: &mut Vec<String>) -> String {
    let mut r = Renderer {
        key,
        slide: true,
        statics,
        out: String::new(),
    };
    r.out.push_str("<section class='slides layout-widescreen'>\n<article>\n");
    r.out.push_str(&format!("<h1>{}</h1>\n", escape(&doc.title)));
    if !doc.subtitle.is_empty() {
        r.out.push_str(&format!("<h3>{}</h3>\n", escape(&doc.subtitle)));
    }
    if doc.date != DateTime::<Utc>::default() {
        r.out
            .push_str(&format!("<h3>{}</h3>\n", doc.date.format("%-d %B %Y")));
    }
    if !doc.authors.is_empty() {
        r.out.push_str("<div class=\"presenter\">\n");
        for author in &doc.authors {
            r.out.push_str(&format!("<p>\n{}\n</p>\n", escape(author)));
        }
        r.out.push_str("</div>\n");
    }
    r.out.push_str("</article>\n");

    for section in &doc.sections {
        r.out.push_str("<article>\n");
        if !section.title.is_empty() {
            r.out
                .push_str(&format!("<h3>{}</h3>\n", escape(&section.title)));
        }
        r.elems(&section.elems);
        r.out.push_str("</article>\n");
    }
    r.out.push_str("</section>\n");
    r.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statics::{NoStatics, StaticStream};
    use std::collections::HashMap;

    struct MapStatics(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl StaticResolver for MapStatics {
        async fn open(&self, relative_path: &str) -> StaticStream {
            match self.0.get(relative_path) {
                Some(text) => StaticStream::from_bytes(text.as_bytes().to_vec()),
                None => StaticStream::failed(format!("{relative_path} not found")),
            }
        }
    }

    const DOC: &str = "Title
Subtitle
2 Jan 2006
Tags: foo, bar, baz

Author Name
Job title, Company

* Title of slide or section (must have asterisk)

Some Text

** Subsection

- bullets
- more bullets
- a bullet with

*** Sub-subsection

Some More text

  Preformatted text
  is indented (however you like)

Further Text, including invocations like:

.code hello.go
.image image.jpg
.image http://foo/image.jpg
.link http://foo label

Again, more text
";

    fn statics() -> MapStatics {
        MapStatics(HashMap::from([(
            "hello.go",
            "func main() {\n    fmt.Println(\"hello tw\")\n}\n",
        )]))
    }

    #[tokio::test]
    async fn article_header_and_body() {
        let meta = PresentGenerator::article()
            .generate(DOC.as_bytes(), &statics())
            .await
            .unwrap();

        assert_eq!(meta.key, "Title");
        assert_eq!(meta.title, "Title");
        assert_eq!(meta.date.format("%Y-%m-%d").to_string(), "2006-01-02");
        assert_eq!(meta.tags, vec!["foo", "bar", "baz"]);
        assert!(!meta.is_slide);
        assert_eq!(meta.static_list, vec!["image.jpg"]);

        let c = &meta.content;
        assert!(c.starts_with("<h2>Subtitle</h2>\n"));
        assert!(c.contains("<h4 id=\"TOC_1.1.\">Subsection</h4>"));
        assert!(c.contains("<h4 id=\"TOC_1.1.1.\">Sub-subsection</h4>"));
        assert!(c.contains("<li>more bullets</li>"));
        assert!(c.contains("<pre>Preformatted text\nis indented (however you like)</pre>"));
        assert!(c.contains("<span num=\"2\">    fmt.Println(&#34;hello tw&#34;)</span>"));
        assert!(c.contains("<img src=\"/images/Title/image.jpg\">"));
        assert!(c.contains("<img src=\"http://foo/image.jpg\">"));
        assert!(c.contains("<a href=\"http://foo\" target=\"_blank\">label</a>"));
        assert!(c.contains("Again, more text"));
        // A single top-level section is rendered without its own heading.
        assert!(!c.contains("must have asterisk"));
    }

    #[tokio::test]
    async fn slide_wraps_sections_in_articles() {
        let meta = PresentGenerator::slide()
            .generate(DOC.as_bytes(), &statics())
            .await
            .unwrap();

        assert!(meta.is_slide);
        let c = &meta.content;
        assert!(c.starts_with("<section class='slides layout-widescreen'>"));
        assert!(c.contains("<h1>Title</h1>\n<h3>Subtitle</h3>\n<h3>2 January 2006</h3>"));
        assert!(c.contains("<div class=\"presenter\">"));
        assert!(c.contains("Job title, Company"));
        assert!(c.contains("<h3>Title of slide or section (must have asterisk)</h3>"));
        assert!(c.contains("<h2 id=\"TOC_1.1.\">1.1. Subsection</h2>"));
        assert!(c.contains("<h3 id=\"TOC_1.1.1.\">1.1.1. Sub-subsection</h3>"));
        assert!(c.trim_end().ends_with("</section>"));
    }

    #[tokio::test]
    async fn missing_embedded_file_does_not_abort() {
        let meta = PresentGenerator::article()
            .generate(DOC.as_bytes(), &NoStatics)
            .await
            .unwrap();
        assert!(meta.content.contains("<div class=\"code\"><pre></pre></div>"));
        assert!(meta.content.contains("Again, more text"));
    }

    #[tokio::test]
    async fn multiple_sections_get_headings_in_articles() {
        let doc = "Two Parts\n\n* One\n\nfirst\n\n* Two\n\nsecond\n";
        let meta = PresentGenerator::article()
            .generate(doc.as_bytes(), &NoStatics)
            .await
            .unwrap();
        assert_eq!(meta.key, "Two_Parts");
        assert!(meta.content.contains("<h4 id=\"TOC_1.\">One</h4>"));
        assert!(meta.content.contains("<h4 id=\"TOC_2.\">Two</h4>"));
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let err = PresentGenerator::article()
            .generate(b"\n\n", &NoStatics)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::MissingHeader));
    }

    #[tokio::test]
    async fn text_is_escaped() {
        let doc = "Esc\n\n* S\n\na <b> & c\n";
        let meta = PresentGenerator::article()
            .generate(doc.as_bytes(), &NoStatics)
            .await
            .unwrap();
        assert!(meta.content.contains("a &lt;b&gt; &amp; c"));
    }

    #[test]
    fn matches_by_extension() {
        assert!(PresentGenerator::article().matches("a/b.article"));
        assert!(!PresentGenerator::article().matches("a/b.slide"));
        assert!(PresentGenerator::slide().matches("talk.slide"));
    }
}
