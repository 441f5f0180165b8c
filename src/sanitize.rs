use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// Inline tags the bot API formatting mode accepts. Everything else is either
// converted to plain-text structure or unwrapped.
const ALLOWED_INLINE: [&str; 13] = [
    "b", "strong", "i", "em", "u", "ins", "s", "strike", "del", "code", "pre", "blockquote",
    "tg-spoiler",
];

static RE_DANGEROUS_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<iframe\b[^>]*>.*?</iframe\s*>|<form\b[^>]*>.*?</form\s*>",
    )
    .unwrap()
});
// Unterminated dangerous element: drop everything from the opener on.
static RE_DANGEROUS_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:script|style|iframe|form)\b[^>]*>.*").unwrap());
static RE_DANGEROUS_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(?:script|style|iframe|form)\s*>").unwrap());

static RE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<table\b[^>]*>.*?</table\s*>").unwrap());
static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?\s*>").unwrap());
static RE_HR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<hr[^>]*>").unwrap());
static RE_LI_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<li(\s[^>]*)?>").unwrap());
static RE_BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(?:p|div|h[1-6]|ul|ol|tr)(\s[^>]*)?>").unwrap());

static RE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9-]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#).unwrap());
static RE_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap());
static RE_EMOJI_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)emoji-id\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap());

static RE_MANY_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_BULLET_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"•[ \t]+").unwrap());

/// Reduce arbitrary rich text to the restricted markup subset the bot API
/// accepts. Idempotent: sanitizing sanitized output changes nothing.
pub fn sanitize_html(input: &str) -> String {
    let text = remove_dangerous(input);
    let text = convert_blocks(&text);
    let text = rewrite_tags(&text);
    normalize_whitespace(&text)
}

/// Drop every remaining tag token, for the plain-text fallback path.
pub fn strip_tags(input: &str) -> String {
    let text = remove_dangerous(input);
    let text = convert_blocks(&text);
    let text = RE_TAG.replace_all(&text, "");
    normalize_whitespace(&text)
}

/// Escape text that gets embedded into a formatted message.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn remove_dangerous(input: &str) -> String {
    let text = RE_DANGEROUS_PAIR.replace_all(input, "");
    let text = RE_DANGEROUS_OPEN.replace_all(&text, "");
    RE_DANGEROUS_CLOSE.replace_all(&text, "").into_owned()
}

fn convert_blocks(input: &str) -> String {
    let text = RE_TABLE.replace_all(input, "\n[table omitted]\n");
    let text = RE_BR.replace_all(&text, "\n");
    let text = RE_HR.replace_all(&text, "\n---\n");
    let text = RE_LI_OPEN.replace_all(&text, "\n• ");
    RE_BLOCK_BREAK.replace_all(&text, "\n\n").into_owned()
}

fn rewrite_tags(input: &str) -> String {
    // Stack entries remember whether the matching opener survived, so a
    // dropped <span>/<a> swallows its own closer.
    let mut span_kept: Vec<bool> = Vec::new();
    let mut anchor_kept: Vec<bool> = Vec::new();

    RE_TAG
        .replace_all(input, |caps: &Captures| {
            let closing = !caps[1].is_empty();
            let name = caps[2].to_lowercase();
            let attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");

            if ALLOWED_INLINE.contains(&name.as_str()) {
                return if closing {
                    format!("</{name}>")
                } else {
                    format!("<{name}>")
                };
            }

            match name.as_str() {
                "a" => {
                    if closing {
                        match anchor_kept.pop() {
                            Some(true) => "</a>".to_string(),
                            _ => String::new(),
                        }
                    } else if let Some(href) = first_capture(&RE_HREF, attrs) {
                        anchor_kept.push(true);
                        format!("<a href=\"{href}\">")
                    } else {
                        anchor_kept.push(false);
                        String::new()
                    }
                }
                "span" => {
                    if closing {
                        match span_kept.pop() {
                            Some(true) => "</span>".to_string(),
                            _ => String::new(),
                        }
                    } else if attrs.contains("tg-spoiler") {
                        span_kept.push(true);
                        "<span class=\"tg-spoiler\">".to_string()
                    } else {
                        span_kept.push(false);
                        String::new()
                    }
                }
                "tg-emoji" => {
                    if closing {
                        "</tg-emoji>".to_string()
                    } else if let Some(id) = first_capture(&RE_EMOJI_ID, attrs) {
                        format!("<tg-emoji emoji-id=\"{id}\">")
                    } else {
                        String::new()
                    }
                }
                // Everything else is spliced out of the tree: the tag goes,
                // its children stay.
                _ => String::new(),
            }
        })
        .into_owned()
}

fn first_capture(re: &Regex, attrs: &str) -> Option<String> {
    re.captures(attrs).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
    })
}

fn normalize_whitespace(input: &str) -> String {
    let trimmed: Vec<&str> = input.lines().map(str::trim).collect();
    let text = trimmed.join("\n");
    let text = RE_MANY_NEWLINES.replace_all(&text, "\n\n");
    let text = RE_BULLET_SPACE.replace_all(&text, "• ");
    text.trim().to_string()
}
