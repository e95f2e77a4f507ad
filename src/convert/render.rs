use crate::error::ConvertError;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::OnceLock;

/// Output of the HTML-to-Markdown renderer.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub markdown: String,
    pub title: Option<String>,
    pub content_html: String,
}

/// Containers likely to hold the article, probed in order. The first whose
/// text content is substantial wins; otherwise the body is used whole.
const CONTENT_CANDIDATES: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    ".post-content",
    ".article-content",
    ".article-body",
    ".entry-content",
    ".markdown-body",
    ".rich_media_content",
    ".content",
];

const CANDIDATE_MIN_TEXT: usize = 200;

/// Tags that never contribute to the article text.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form",
    "button", "iframe", "svg", "select", "input", "dialog",
];

/// Class fragments marking boilerplate containers.
const NOISE_CLASS_FRAGMENTS: &[&str] = &[
    "sidebar", "comment", "related", "share-", "social", "advert", "banner", "breadcrumb",
    "menu", "navbar", "pagination", "subscribe-box",
];

/// Convert HTML to Markdown plus a title and the selected content subtree.
///
/// With a `selector` the caller picks the content root; without one a small
/// readability pass probes common article containers and falls back to the
/// whole body.
pub fn html_to_markdown(html: &str, selector: Option<&str>) -> Result<Rendered, ConvertError> {
    let doc = Html::parse_document(html);

    let root = match selector {
        Some(raw) => {
            let sel = Selector::parse(raw)
                .map_err(|e| ConvertError::InvalidSelector(format!("{:?}: {:?}", raw, e)))?;
            doc.select(&sel).next().unwrap_or_else(|| body_or_root(&doc))
        }
        None => pick_content_root(&doc),
    };

    let title = extract_title(&doc, root);

    let mut out = String::new();
    let mut ctx = WalkContext::default();
    walk(*root, &mut out, &mut ctx);

    let markdown = tidy_markdown(&out);
    Ok(Rendered {
        markdown,
        title,
        content_html: root.inner_html(),
    })
}

/// Plain-text rendering of the selected content (for `format=text`).
pub fn html_to_text(html: &str, selector: Option<&str>) -> Result<String, ConvertError> {
    let rendered = html_to_markdown(html, selector)?;
    Ok(markdown_to_text(&rendered.markdown))
}

/// Strip markdown syntax, keeping the readable text.
pub fn markdown_to_text(markdown: &str) -> String {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    static IMG_RE: OnceLock<Regex> = OnceLock::new();
    static MARKS_RE: OnceLock<Regex> = OnceLock::new();
    let img = IMG_RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
    let link = LINK_RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
    let marks = MARKS_RE.get_or_init(|| Regex::new(r"(?m)^#{1,6}\s+|[*_`]{1,3}|^>\s?").unwrap());

    let out = img.replace_all(markdown, "$1");
    let out = link.replace_all(&out, "$1");
    marks.replace_all(&out, "").trim().to_string()
}

/// Rewrite absolute image URLs through the gateway's `/img/` proxy
/// (hotlink-protected CDNs reject direct references).
pub fn rewrite_image_urls(markdown: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\((https?://[^)\s]+)\)").unwrap());
    re.replace_all(markdown, |caps: &regex::Captures| {
        format!("![{}](/img/{})", &caps[1], urlencode_component(&caps[2]))
    })
    .into_owned()
}

fn urlencode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn body_or_root(doc: &Html) -> ElementRef<'_> {
    static BODY: OnceLock<Selector> = OnceLock::new();
    let sel = BODY.get_or_init(|| Selector::parse("body").unwrap());
    doc.select(sel).next().unwrap_or_else(|| doc.root_element())
}

fn pick_content_root(doc: &Html) -> ElementRef<'_> {
    for candidate in CONTENT_CANDIDATES {
        let Ok(sel) = Selector::parse(candidate) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let text_len: usize = el.text().map(|t| t.trim().len()).sum();
            if text_len >= CANDIDATE_MIN_TEXT {
                return el;
            }
        }
    }
    body_or_root(doc)
}

fn extract_title(doc: &Html, root: ElementRef<'_>) -> Option<String> {
    static TITLE: OnceLock<Selector> = OnceLock::new();
    static OG: OnceLock<Selector> = OnceLock::new();
    static H1: OnceLock<Selector> = OnceLock::new();

    let title_sel = TITLE.get_or_init(|| Selector::parse("title").unwrap());
    if let Some(el) = doc.select(title_sel).next() {
        let text = el.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }

    let og_sel = OG.get_or_init(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
    if let Some(el) = doc.select(og_sel).next() {
        if let Some(content) = el.value().attr("content") {
            let content = content.trim();
            if !content.is_empty() {
                return Some(content.to_string());
            }
        }
    }

    let h1_sel = H1.get_or_init(|| Selector::parse("h1").unwrap());
    root.select(h1_sel).next().and_then(|el| {
        let text = el.text().collect::<String>().trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    })
}

#[derive(Default)]
struct WalkContext {
    /// Nesting of lists; each entry is the next ordinal for ordered lists,
    /// `None` for unordered.
    list_stack: Vec<Option<usize>>,
}

fn is_noise_element(el: &ElementRef) -> bool {
    let name = el.value().name();
    if SKIP_TAGS.contains(&name) {
        return true;
    }
    if let Some(class) = el.value().attr("class") {
        let class = class.to_ascii_lowercase();
        if NOISE_CLASS_FRAGMENTS.iter().any(|f| class.contains(f)) {
            return true;
        }
    }
    false
}

fn walk(node: ego_tree::NodeRef<'_, Node>, out: &mut String, ctx: &mut WalkContext) {
    match node.value() {
        Node::Text(text) => {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.is_empty() {
                return;
            }
            if !out.is_empty() && !out.ends_with(char::is_whitespace) && !out.ends_with('(') {
                out.push(' ');
            }
            out.push_str(&collapsed);
        }
        Node::Element(_) => {
            let el = ElementRef::wrap(node).expect("element node");
            if is_noise_element(&el) {
                return;
            }
            emit_element(el, out, ctx);
        }
        _ => {}
    }
}

fn walk_children(node: ego_tree::NodeRef<'_, Node>, out: &mut String, ctx: &mut WalkContext) {
    for child in node.children() {
        walk(child, out, ctx);
    }
}

fn block_break(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
    if !out.is_empty() && !out.ends_with("\n\n") {
        while out.ends_with('\n') {
            out.pop();
        }
        out.push_str("\n\n");
    }
}

fn emit_element(el: ElementRef<'_>, out: &mut String, ctx: &mut WalkContext) {
    let name = el.value().name();
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            block_break(out);
            let level = name.as_bytes()[1] - b'0';
            for _ in 0..level {
                out.push('#');
            }
            out.push(' ');
            walk_children(*el, out, ctx);
            block_break(out);
        }
        "p" | "section" | "article" | "div" | "figure" | "main" | "body" | "html" | "tr" => {
            block_break(out);
            walk_children(*el, out, ctx);
            block_break(out);
        }
        "br" => out.push('\n'),
        "hr" => {
            block_break(out);
            out.push_str("---");
            block_break(out);
        }
        "strong" | "b" => {
            inline_wrap(el, out, ctx, "**");
        }
        "em" | "i" => {
            inline_wrap(el, out, ctx, "*");
        }
        "del" | "s" => {
            inline_wrap(el, out, ctx, "~~");
        }
        "code" => {
            let text: String = el.text().collect();
            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push('`');
            out.push_str(text.trim());
            out.push('`');
        }
        "pre" => {
            block_break(out);
            out.push_str("```\n");
            let text: String = el.text().collect();
            out.push_str(text.trim_end());
            out.push_str("\n```");
            block_break(out);
        }
        "blockquote" => {
            block_break(out);
            let mut inner = String::new();
            walk_children(*el, &mut inner, ctx);
            for line in tidy_markdown(&inner).lines() {
                out.push_str("> ");
                out.push_str(line);
                out.push('\n');
            }
            block_break(out);
        }
        "ul" => {
            emit_list(el, out, ctx, None);
        }
        "ol" => {
            emit_list(el, out, ctx, Some(1));
        }
        "li" => {
            // Stray <li> outside a list — render as an unordered item.
            emit_list_item(el, out, ctx);
        }
        "a" => {
            let href = el.value().attr("href").unwrap_or_default();
            let mut text = String::new();
            walk_children(*el, &mut text, ctx);
            let text = text.trim();
            if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
                if !text.is_empty() {
                    push_inline(out, text);
                }
            } else if text.is_empty() {
                push_inline(out, &format!("[{}]({})", href, href));
            } else {
                push_inline(out, &format!("[{}]({})", text, href));
            }
        }
        "img" => {
            let src = el
                .value()
                .attr("src")
                .or_else(|| el.value().attr("data-src"))
                .unwrap_or_default();
            if !src.is_empty() && !src.starts_with("data:") {
                let alt = el.value().attr("alt").unwrap_or_default();
                block_break(out);
                out.push_str(&format!("![{}]({})", alt.trim(), src));
                block_break(out);
            }
        }
        "table" => emit_table(el, out, ctx),
        "figcaption" | "caption" => {
            block_break(out);
            out.push('*');
            walk_children(*el, out, ctx);
            out.push('*');
            block_break(out);
        }
        "td" | "th" => {
            walk_children(*el, out, ctx);
            out.push(' ');
        }
        _ => walk_children(*el, out, ctx),
    }
}

fn push_inline(out: &mut String, text: &str) {
    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push_str(text);
}

fn inline_wrap(el: ElementRef<'_>, out: &mut String, ctx: &mut WalkContext, mark: &str) {
    let mut inner = String::new();
    walk_children(*el, &mut inner, ctx);
    let inner = inner.trim();
    if inner.is_empty() {
        return;
    }
    push_inline(out, &format!("{}{}{}", mark, inner, mark));
}

fn emit_list(el: ElementRef<'_>, out: &mut String, ctx: &mut WalkContext, ordered: Option<usize>) {
    block_break(out);
    ctx.list_stack.push(ordered);
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if child_el.value().name() == "li" {
                emit_list_item(child_el, out, ctx);
            }
        }
    }
    ctx.list_stack.pop();
    block_break(out);
}

fn emit_list_item(el: ElementRef<'_>, out: &mut String, ctx: &mut WalkContext) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    let depth = ctx.list_stack.len().saturating_sub(1);
    for _ in 0..depth {
        out.push_str("  ");
    }
    let marker = match ctx.list_stack.last_mut() {
        Some(Some(n)) => {
            let m = format!("{}. ", n);
            *n += 1;
            m
        }
        _ => "- ".to_string(),
    };
    out.push_str(&marker);

    let mut inner = String::new();
    walk_children(*el, &mut inner, ctx);
    // Nested blocks inside an item flow on continuation lines.
    let inner = tidy_markdown(&inner);
    let mut lines = inner.lines();
    if let Some(first) = lines.next() {
        out.push_str(first);
    }
    for line in lines {
        out.push('\n');
        for _ in 0..depth {
            out.push_str("  ");
        }
        if !line.starts_with("- ") && !line.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            out.push_str("  ");
        }
        out.push_str(line);
    }
    out.push('\n');
}

fn emit_table(el: ElementRef<'_>, out: &mut String, ctx: &mut WalkContext) {
    static TR: OnceLock<Selector> = OnceLock::new();
    static CELL: OnceLock<Selector> = OnceLock::new();
    let tr = TR.get_or_init(|| Selector::parse("tr").unwrap());
    let cell = CELL.get_or_init(|| Selector::parse("td, th").unwrap());

    block_break(out);
    let mut first_row = true;
    for row in el.select(tr) {
        let cells: Vec<String> = row
            .select(cell)
            .map(|c| {
                let mut s = String::new();
                walk_children(*c, &mut s, ctx);
                s.trim().replace('|', "\\|").replace('\n', " ")
            })
            .collect();
        if cells.is_empty() {
            continue;
        }
        out.push_str("| ");
        out.push_str(&cells.join(" | "));
        out.push_str(" |\n");
        if first_row {
            out.push('|');
            for _ in &cells {
                out.push_str(" --- |");
            }
            out.push('\n');
            first_row = false;
        }
    }
    block_break(out);
}

fn tidy_markdown(raw: &str) -> String {
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    let re = BLANKS.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    let trimmed: Vec<&str> = raw.lines().map(|l| l.trim_end()).collect();
    re.replace_all(&trimmed.join("\n"), "\n\n")
        .trim()
        .to_string()
}
