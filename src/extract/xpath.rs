use crate::error::ConvertError;

fn unsupported(detail: &str) -> ConvertError {
    ConvertError::InvalidRequest(format!("UnsupportedXPath: {}", detail))
}

enum Axis {
    Child,
    Descendant,
}

/// Translate a restricted XPath subset to a CSS selector.
///
/// Supported grammar: `/` (child), `//` (descendant), tag names or `*`,
/// `[n]` positional predicates, `[@attr='v']`, `[contains(@attr,'v')]`,
/// and a trailing `text()` step (ignored). Anything else is rejected
/// explicitly instead of degrading silently.
pub fn xpath_to_css(xpath: &str) -> Result<String, ConvertError> {
    let mut rest = xpath.trim();
    if rest.is_empty() {
        return Err(unsupported("empty expression"));
    }

    let mut css = String::new();
    let mut first = true;

    while !rest.is_empty() {
        let axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            Axis::Child
        } else if first {
            // Relative expressions start at the scope element.
            Axis::Descendant
        } else {
            return Err(unsupported(&format!("unexpected token at: {}", rest)));
        };

        let end = step_end(rest);
        let step = &rest[..end];
        rest = &rest[end..];
        if step.is_empty() {
            return Err(unsupported("empty step"));
        }

        if step == "text()" {
            if !rest.is_empty() {
                return Err(unsupported("text() must be the final step"));
            }
            break;
        }

        let converted = convert_step(step)?;
        if !css.is_empty() {
            match axis {
                Axis::Child => css.push_str(" > "),
                Axis::Descendant => css.push(' '),
            }
        } else if matches!(axis, Axis::Child) && !first {
            css.push_str(" > ");
        }
        css.push_str(&converted);
        first = false;
    }

    if css.is_empty() {
        return Err(unsupported("expression selects no element"));
    }
    Ok(css)
}

/// Index of the step terminator (next unbracketed, unquoted `/`).
fn step_end(s: &str) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => return i,
            _ => {}
        }
    }
    s.len()
}

fn convert_step(step: &str) -> Result<String, ConvertError> {
    let name_end = step.find('[').unwrap_or(step.len());
    let name = &step[..name_end];

    if name != "*"
        && (name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    {
        return Err(unsupported(&format!("bad node test: {}", name)));
    }

    let mut out = String::from(name);
    let mut rest = &step[name_end..];

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(unsupported(&format!("trailing characters: {}", rest)));
        }
        let close = matching_bracket(rest).ok_or_else(|| unsupported("unbalanced bracket"))?;
        let pred = &rest[1..close];
        rest = &rest[close + 1..];
        out.push_str(&convert_predicate(pred)?);
    }

    Ok(out)
}

fn matching_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn convert_predicate(pred: &str) -> Result<String, ConvertError> {
    let pred = pred.trim();

    // [n] — positional
    if pred.chars().all(|c| c.is_ascii_digit()) && !pred.is_empty() {
        return Ok(format!(":nth-of-type({})", pred));
    }

    // [@attr='v']
    if let Some(body) = pred.strip_prefix('@') {
        let (attr, value) = body
            .split_once('=')
            .ok_or_else(|| unsupported(&format!("bare attribute predicate: [{}]", pred)))?;
        let value = strip_quotes(value.trim())
            .ok_or_else(|| unsupported(&format!("unquoted value in [{}]", pred)))?;
        return Ok(format!("[{}=\"{}\"]", attr.trim(), value));
    }

    // [contains(@attr,'v')]
    if let Some(body) = pred
        .strip_prefix("contains(")
        .and_then(|b| b.strip_suffix(')'))
    {
        let (attr, value) = body
            .split_once(',')
            .ok_or_else(|| unsupported(&format!("malformed contains: [{}]", pred)))?;
        let attr = attr
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| unsupported("contains() only supports @attr"))?;
        let value = strip_quotes(value.trim())
            .ok_or_else(|| unsupported(&format!("unquoted value in [{}]", pred)))?;
        return Ok(format!("[{}*=\"{}\"]", attr, value));
    }

    Err(unsupported(&format!("predicate [{}]", pred)))
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        let q = bytes[0];
        if (q == b'\'' || q == b'"') && bytes[s.len() - 1] == q {
            let inner = &s[1..s.len() - 1];
            // A quote inside the value means the predicate was more than a
            // simple quoted literal (e.g. `'a' and @b='c'`).
            if !inner.contains(q as char) {
                return Some(inner);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_paths() {
        assert_eq!(xpath_to_css("//div").unwrap(), "div");
        assert_eq!(xpath_to_css("/html/body/div").unwrap(), "html > body > div");
        assert_eq!(xpath_to_css("//article//p").unwrap(), "article p");
        assert_eq!(xpath_to_css("//div/span").unwrap(), "div > span");
        assert_eq!(xpath_to_css("//*").unwrap(), "*");
    }

    #[test]
    fn test_predicates() {
        assert_eq!(xpath_to_css("//ul/li[2]").unwrap(), "ul > li:nth-of-type(2)");
        assert_eq!(
            xpath_to_css("//div[@class='post']").unwrap(),
            "div[class=\"post\"]"
        );
        assert_eq!(
            xpath_to_css("//a[contains(@href,'download')]").unwrap(),
            "a[href*=\"download\"]"
        );
        assert_eq!(
            xpath_to_css("//div[@id='main']/p[1]").unwrap(),
            "div[id=\"main\"] > p:nth-of-type(1)"
        );
    }

    #[test]
    fn test_text_step_ignored() {
        assert_eq!(xpath_to_css("//h1/text()").unwrap(), "h1");
    }

    #[test]
    fn test_unsupported_constructs() {
        for bad in [
            "//div[last()]",
            "//div[position()>1]",
            "//a/@href",
            "//div[. = 'x']",
            "//div[@a='1' and @b='2']",
            "..//div",
            "//div/text()/span",
            "",
        ] {
            let err = xpath_to_css(bad).unwrap_err();
            assert!(
                err.to_string().contains("UnsupportedXPath"),
                "{:?} should be unsupported, got {}",
                bad,
                err
            );
        }
    }
}
