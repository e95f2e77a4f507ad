mod xpath;

pub use xpath::xpath_to_css;

use crate::error::ConvertError;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Hard cap on extraction input.
pub const MAX_EXTRACT_INPUT: usize = 2 * 1024 * 1024;

/// Match-explosion guard for a single regex label.
const MAX_REGEX_MATCHES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Css,
    XPath,
    Regex,
}

impl FromStr for ExtractionStrategy {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "css" => Ok(Self::Css),
            "xpath" => Ok(Self::XPath),
            "regex" => Ok(Self::Regex),
            other => Err(ConvertError::InvalidRequest(format!(
                "unknown extraction strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectorSchema {
    #[serde(default, alias = "baseSelector")]
    base_selector: Option<String>,
    #[serde(default, alias = "baseXPath")]
    base_xpath: Option<String>,
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Deserialize)]
struct FieldSpec {
    name: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    xpath: Option<String>,
    #[serde(rename = "type", default = "default_field_type")]
    field_type: String,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    multiple: bool,
}

fn default_field_type() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize)]
struct RegexSchema {
    patterns: BTreeMap<String, String>,
    #[serde(default)]
    flags: Option<String>,
}

fn invalid_schema(detail: impl std::fmt::Display) -> ConvertError {
    ConvertError::InvalidRequest(format!("invalid schema: {}", detail))
}

/// Structured extraction over bounded HTML input.
///
/// CSS and XPath share the `{base, fields}` schema; XPath is translated to
/// CSS over the restricted subset in `xpath_to_css`. Regex takes a
/// `{patterns: {label: pattern}}` schema (or the legacy flat label→pattern
/// map) and returns every match per label.
pub fn extract(
    strategy: ExtractionStrategy,
    html: &str,
    schema: &serde_json::Value,
    selector_root: Option<&str>,
) -> Result<serde_json::Value, ConvertError> {
    if html.len() > MAX_EXTRACT_INPUT {
        return Err(ConvertError::InvalidRequest(format!(
            "extraction input exceeds {} bytes",
            MAX_EXTRACT_INPUT
        )));
    }

    match strategy {
        ExtractionStrategy::Css => extract_selectors(html, schema, selector_root, false),
        ExtractionStrategy::XPath => extract_selectors(html, schema, selector_root, true),
        ExtractionStrategy::Regex => extract_regex(html, schema),
    }
}

fn parse_selector(raw: &str) -> Result<Selector, ConvertError> {
    Selector::parse(raw).map_err(|e| invalid_schema(format!("bad selector {:?}: {:?}", raw, e)))
}

fn extract_selectors(
    html: &str,
    schema: &serde_json::Value,
    selector_root: Option<&str>,
    is_xpath: bool,
) -> Result<serde_json::Value, ConvertError> {
    let schema: SelectorSchema =
        serde_json::from_value(schema.clone()).map_err(invalid_schema)?;
    if schema.fields.is_empty() {
        return Err(invalid_schema("schema has no fields"));
    }

    let base_css = if is_xpath {
        match schema.base_xpath.as_deref() {
            Some(xp) => Some(xpath_to_css(xp)?),
            None => None,
        }
    } else {
        schema.base_selector.clone()
    };

    // Pre-compile field selectors once, outside the per-base loop.
    let mut fields: Vec<(&FieldSpec, Selector)> = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        let raw = if is_xpath {
            match field.xpath.as_deref() {
                Some(xp) => xpath_to_css(xp)?,
                None => {
                    return Err(invalid_schema(format!("field {} missing xpath", field.name)))
                }
            }
        } else {
            field
                .selector
                .clone()
                .ok_or_else(|| invalid_schema(format!("field {} missing selector", field.name)))?
        };
        fields.push((field, parse_selector(&raw)?));
    }

    let doc = Html::parse_document(html);

    // Scope: explicit root selector, else the whole document. A missing
    // root falls back to the document body rather than erroring.
    let scope: ElementRef = match selector_root {
        Some(raw) => {
            let sel = parse_selector(raw)?;
            doc.select(&sel).next().unwrap_or_else(|| doc.root_element())
        }
        None => doc.root_element(),
    };

    let bases: Vec<ElementRef> = match base_css {
        Some(raw) => {
            let sel = parse_selector(&raw)?;
            scope.select(&sel).collect()
        }
        None => vec![scope],
    };

    let mut out = Vec::with_capacity(bases.len());
    for base in bases {
        let mut obj = serde_json::Map::new();
        for (field, sel) in &fields {
            let value = if field.multiple {
                let items: Vec<serde_json::Value> = base
                    .select(sel)
                    .filter_map(|el| field_value(field, el))
                    .map(serde_json::Value::String)
                    .collect();
                serde_json::Value::Array(items)
            } else {
                base.select(sel)
                    .next()
                    .and_then(|el| field_value(field, el))
                    .map(serde_json::Value::String)
                    .unwrap_or(serde_json::Value::Null)
            };
            obj.insert(field.name.clone(), value);
        }
        out.push(serde_json::Value::Object(obj));
    }

    Ok(serde_json::Value::Array(out))
}

fn field_value(field: &FieldSpec, el: ElementRef) -> Option<String> {
    match field.field_type.as_str() {
        "html" => Some(el.inner_html()),
        "attribute" => field
            .attribute
            .as_deref()
            .and_then(|a| el.value().attr(a))
            .map(|v| v.to_string()),
        // "text" and anything else default to trimmed text content.
        _ => {
            let text = el.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

fn extract_regex(html: &str, schema: &serde_json::Value) -> Result<serde_json::Value, ConvertError> {
    // Structured form first, then the legacy flat label→pattern map.
    let (patterns, flags) = match serde_json::from_value::<RegexSchema>(schema.clone()) {
        Ok(s) => (s.patterns, s.flags),
        Err(_) => {
            let flat: BTreeMap<String, String> =
                serde_json::from_value(schema.clone()).map_err(invalid_schema)?;
            (flat, None)
        }
    };

    if patterns.is_empty() {
        return Err(invalid_schema("no regex patterns"));
    }

    // "g" is implicit (all matches are collected); i/s/m map to inline flags.
    let flags = flags.unwrap_or_else(|| "g".to_string());
    let mut inline = String::new();
    for f in flags.chars() {
        match f {
            'g' => {}
            'i' | 's' | 'm' => inline.push(f),
            other => {
                return Err(invalid_schema(format!("unsupported regex flag: {}", other)))
            }
        }
    }

    let mut out = serde_json::Map::new();
    for (label, pattern) in &patterns {
        let full = if inline.is_empty() {
            pattern.clone()
        } else {
            format!("(?{}){}", inline, pattern)
        };
        let re = regex::Regex::new(&full)
            .map_err(|e| invalid_schema(format!("pattern {:?}: {}", label, e)))?;

        let mut matches = Vec::new();
        let mut pos = 0usize;
        while pos <= html.len() {
            let Some(m) = re.find_at(html, pos) else {
                break;
            };
            matches.push(serde_json::Value::String(m.as_str().to_string()));
            if matches.len() > MAX_REGEX_MATCHES {
                return Err(ConvertError::InvalidRequest(format!(
                    "match explosion for label {:?} (> {} matches)",
                    label, MAX_REGEX_MATCHES
                )));
            }
            // Zero-length matches advance by one to avoid spinning in place.
            pos = if m.end() > m.start() {
                m.end()
            } else {
                match html[m.end()..].chars().next() {
                    Some(c) => m.end() + c.len_utf8(),
                    None => break,
                }
            };
        }
        out.insert(label.clone(), serde_json::Value::Array(matches));
    }

    Ok(serde_json::Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HTML: &str = r#"
        <html><body>
        <div class="listing">
          <article class="item" data-id="1">
            <h2 class="title">First post</h2>
            <a class="link" href="/posts/1">read</a>
            <span class="tag">rust</span><span class="tag">http</span>
          </article>
          <article class="item" data-id="2">
            <h2 class="title">Second post</h2>
            <a class="link" href="/posts/2">read</a>
            <span class="tag">markdown</span>
          </article>
        </div>
        </body></html>"#;

    #[test]
    fn test_css_extraction_with_fields() {
        let schema = json!({
            "baseSelector": "article.item",
            "fields": [
                {"name": "title", "selector": "h2.title", "type": "text"},
                {"name": "href", "selector": "a.link", "type": "attribute", "attribute": "href"},
                {"name": "tags", "selector": "span.tag", "type": "text", "multiple": true},
                {"name": "missing", "selector": ".nope", "type": "text"}
            ]
        });
        let out = extract(ExtractionStrategy::Css, HTML, &schema, None).unwrap();
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["title"], "First post");
        assert_eq!(arr[0]["href"], "/posts/1");
        assert_eq!(arr[0]["tags"], json!(["rust", "http"]));
        assert_eq!(arr[0]["missing"], serde_json::Value::Null);
        assert_eq!(arr[1]["title"], "Second post");
    }

    #[test]
    fn test_xpath_extraction() {
        let schema = json!({
            "baseXPath": "//article[contains(@class,'item')]",
            "fields": [
                {"name": "title", "xpath": "//h2", "type": "text"},
                {"name": "link", "xpath": "//a[@class='link']", "type": "attribute", "attribute": "href"}
            ]
        });
        let out = extract(ExtractionStrategy::XPath, HTML, &schema, None).unwrap();
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["title"], "First post");
        assert_eq!(arr[1]["link"], "/posts/2");
    }

    #[test]
    fn test_unsupported_xpath_is_explicit() {
        let schema = json!({
            "baseXPath": "//article[last()]",
            "fields": [{"name": "t", "xpath": "//h2"}]
        });
        let err = extract(ExtractionStrategy::XPath, HTML, &schema, None).unwrap_err();
        assert!(err.to_string().contains("UnsupportedXPath"));
    }

    #[test]
    fn test_selector_root_scopes_extraction() {
        let schema = json!({
            "fields": [{"name": "text", "selector": "h2", "type": "text"}]
        });
        let out =
            extract(ExtractionStrategy::Css, HTML, &schema, Some("article[data-id='2']")).unwrap();
        assert_eq!(out.as_array().unwrap()[0]["text"], "Second post");
    }

    #[test]
    fn test_regex_extraction_structured_and_legacy() {
        let schema = json!({
            "patterns": {"ids": r#"data-id="(\d)""#},
            "flags": "g"
        });
        let out = extract(ExtractionStrategy::Regex, HTML, &schema, None).unwrap();
        assert_eq!(out["ids"].as_array().unwrap().len(), 2);

        // Legacy flat map form.
        let legacy = json!({"titles": "(First|Second) post"});
        let out = extract(ExtractionStrategy::Regex, HTML, &legacy, None).unwrap();
        assert_eq!(out["titles"], json!(["First post", "Second post"]));
    }

    #[test]
    fn test_regex_case_insensitive_flag() {
        let schema = json!({"patterns": {"m": "FIRST POST"}, "flags": "gi"});
        let out = extract(ExtractionStrategy::Regex, HTML, &schema, None).unwrap();
        assert_eq!(out["m"], json!(["First post"]));
    }

    #[test]
    fn test_regex_schema_errors() {
        let empty = json!({"patterns": {}});
        assert!(extract(ExtractionStrategy::Regex, HTML, &empty, None).is_err());

        let bad = json!({"patterns": {"x": "(unclosed"}});
        assert!(extract(ExtractionStrategy::Regex, HTML, &bad, None).is_err());

        let bad_flag = json!({"patterns": {"x": "a"}, "flags": "gx"});
        assert!(extract(ExtractionStrategy::Regex, HTML, &bad_flag, None).is_err());
    }

    #[test]
    fn test_regex_match_explosion_guard() {
        let big = "a".repeat(2000);
        let schema = json!({"patterns": {"every": "a?"}});
        let err = extract(ExtractionStrategy::Regex, &big, &schema, None).unwrap_err();
        assert!(err.to_string().contains("match explosion"));
    }

    #[test]
    fn test_zero_length_matches_advance() {
        // A pattern that can match empty still terminates and yields
        // bounded results on small input.
        let schema = json!({"patterns": {"z": "x*"}});
        let out = extract(ExtractionStrategy::Regex, "abc", &schema, None).unwrap();
        assert!(out["z"].as_array().unwrap().len() <= 4);
    }

    #[test]
    fn test_input_size_cap() {
        let big = "x".repeat(MAX_EXTRACT_INPUT + 1);
        let schema = json!({"patterns": {"x": "x"}});
        let err = extract(ExtractionStrategy::Regex, &big, &schema, None).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidRequest(_)));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("css".parse::<ExtractionStrategy>().unwrap(), ExtractionStrategy::Css);
        assert_eq!(
            "XPATH".parse::<ExtractionStrategy>().unwrap(),
            ExtractionStrategy::XPath
        );
        assert!("jsonpath".parse::<ExtractionStrategy>().is_err());
    }
}
