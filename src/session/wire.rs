//! Wire codec for the comment server protocol.
//!
//! Frames are NUL-terminated text elements in a pseudo-XML dialect:
//!
//! ```text
//! <thread thread="T" res_from="-1" version="20061206" />
//! <thread resultcode="0" last_res="N" ticket="X" server_time="T" ... />
//! <chat thread="T" ticket="X" vpos="V" postkey="P" user_id="U">TEXT</chat>
//! <chat_result status="0"/>
//! <chat no="N" date="D" ... premium="B" anonymity="A">TEXT</chat>
//! ```
//!
//! The dialect is shallow (one element per frame, attributes plus an
//! optional text body), so this module carries its own scanner instead of
//! an XML dependency.

use std::collections::HashMap;

use anyhow::{bail, Result};

/// Protocol version sent in the open-thread frame.
pub const THREAD_VERSION: &str = "20061206";

/// A decoded wire element: tag name, attributes, optional text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireElement {
    /// Element tag (`thread`, `chat`, `chat_result`).
    pub name: String,
    /// Attribute map; values are entity-unescaped.
    pub attrs: HashMap<String, String>,
    /// Text body for container elements; empty for self-closing ones.
    pub body: String,
}

impl WireElement {
    /// Fetches an attribute, or an empty string when absent.
    pub fn attr(&self, key: &str) -> &str {
        self.attrs.get(key).map_or("", String::as_str)
    }

    /// Fetches an attribute parsed as an integer; `None` on absence or
    /// garbage.
    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(|v| v.parse().ok())
    }
}

/// Escape the five XML entities for attribute values and text bodies.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]. Unknown entities pass through untouched.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (entity, len) = match rest {
            r if r.starts_with("&amp;") => ("&", 5),
            r if r.starts_with("&lt;") => ("<", 4),
            r if r.starts_with("&gt;") => (">", 4),
            r if r.starts_with("&quot;") => ("\"", 6),
            r if r.starts_with("&apos;") => ("'", 6),
            _ => ("&", 1),
        };
        out.push_str(entity);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// Builds the open-thread frame for a comment or notification connection.
pub fn build_thread_open(thread: &str) -> String {
    format!(
        "<thread thread=\"{}\" res_from=\"-1\" version=\"{}\" />",
        escape(thread),
        THREAD_VERSION
    )
}

/// Options for an outgoing chat frame.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Post as anonymous (adds `mail="184"`).
    pub anonymous: bool,
    /// Post with owner privileges (adds `premium="1"`).
    pub owner: bool,
}

/// Builds an outgoing chat frame.
#[allow(clippy::too_many_arguments)]
pub fn build_chat(
    thread: &str,
    ticket: &str,
    vpos: i64,
    postkey: &str,
    user_id: &str,
    text: &str,
    opts: &ChatOptions,
) -> String {
    let mut frame = format!(
        "<chat thread=\"{}\" ticket=\"{}\" vpos=\"{}\" postkey=\"{}\"",
        escape(thread),
        escape(ticket),
        vpos,
        escape(postkey),
    );
    if opts.anonymous {
        frame.push_str(" mail=\"184\"");
    }
    if opts.owner {
        frame.push_str(" premium=\"1\"");
    }
    frame.push_str(&format!(
        " user_id=\"{}\">{}</chat>",
        escape(user_id),
        escape(text)
    ));
    frame
}

/// Parses one wire frame into a [`WireElement`].
///
/// Accepts both self-closing (`<tag …/>`) and container
/// (`<tag …>body</tag>`) forms. The NUL terminator must already be
/// stripped by the transport.
pub fn parse_frame(frame: &str) -> Result<WireElement> {
    let frame = frame.trim();
    let rest = frame
        .strip_prefix('<')
        .ok_or_else(|| anyhow::anyhow!("frame does not start with '<': {frame:?}"))?;

    let name_end = rest
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        bail!("empty tag name in frame: {frame:?}");
    }
    let rest = &rest[name_end..];

    // Locate the end of the opening tag, respecting quoted attribute values.
    let mut in_quote = false;
    let mut tag_end = None;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '>' if !in_quote => {
                tag_end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(tag_end) = tag_end else {
        bail!("unterminated tag in frame: {frame:?}");
    };

    let (attr_src, self_closing) = match rest[..tag_end].strip_suffix('/') {
        Some(stripped) => (stripped, true),
        None => (&rest[..tag_end], false),
    };
    let attrs = parse_attrs(attr_src)?;

    let body = if self_closing {
        String::new()
    } else {
        let after = &rest[tag_end + 1..];
        let close = format!("</{name}>");
        let Some(end) = after.rfind(&close) else {
            bail!("missing </{name}> in frame: {frame:?}");
        };
        unescape(&after[..end])
    };

    Ok(WireElement {
        name: name.to_string(),
        attrs,
        body,
    })
}

/// Parses `key="value"` attribute pairs.
fn parse_attrs(src: &str) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    let mut rest = src.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(eq) => eq,
            None => bail!("attribute without value: {rest:?}"),
        };
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            bail!("malformed attribute name: {rest:?}");
        }
        let after = rest[eq + 1..].trim_start();
        let Some(val) = after.strip_prefix('"') else {
            bail!("attribute value not quoted: {rest:?}");
        };
        let Some(end) = val.find('"') else {
            bail!("unterminated attribute value: {rest:?}");
        };
        attrs.insert(key.to_string(), unescape(&val[..end]));
        rest = val[end + 1..].trim_start();
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_open_format() {
        let frame = build_thread_open("1234567");
        assert_eq!(
            frame,
            "<thread thread=\"1234567\" res_from=\"-1\" version=\"20061206\" />"
        );
    }

    #[test]
    fn test_parse_thread_response() {
        let el = parse_frame(
            "<thread resultcode=\"0\" thread=\"1234567\" last_res=\"25286040\" \
             ticket=\"0x3f5a\" revision=\"1\" server_time=\"1500000000\"/>",
        )
        .unwrap();
        assert_eq!(el.name, "thread");
        assert_eq!(el.attr_u64("last_res"), Some(25_286_040));
        assert_eq!(el.attr("ticket"), "0x3f5a");
        assert_eq!(el.attr_u64("server_time"), Some(1_500_000_000));
        assert!(el.body.is_empty());
    }

    #[test]
    fn test_parse_chat_with_body() {
        let el = parse_frame(
            "<chat no=\"120\" date=\"1500000300\" date_usec=\"250000\" mail=\"184\" \
             user_id=\"abcDEF-42\" premium=\"5\" anonymity=\"1\" locale=\"ja-jp\" \
             score=\"-300\">hello &amp; goodbye</chat>",
        )
        .unwrap();
        assert_eq!(el.name, "chat");
        assert_eq!(el.attr_u64("no"), Some(120));
        assert_eq!(el.attr("premium"), "5");
        assert_eq!(el.body, "hello & goodbye");
    }

    #[test]
    fn test_parse_chat_result() {
        let el = parse_frame("<chat_result status=\"0\"/>").unwrap();
        assert_eq!(el.name, "chat_result");
        assert_eq!(el.attr("status"), "0");

        let el = parse_frame("<chat_result status=\"4\"/>").unwrap();
        assert_eq!(el.attr("status"), "4");
    }

    #[test]
    fn test_build_chat_plain() {
        let frame = build_chat("t1", "tick", 4200, "pk", "100", "hi", &ChatOptions::default());
        assert_eq!(
            frame,
            "<chat thread=\"t1\" ticket=\"tick\" vpos=\"4200\" postkey=\"pk\" \
             user_id=\"100\">hi</chat>"
        );
    }

    #[test]
    fn test_build_chat_anonymous_owner() {
        let frame = build_chat(
            "t1",
            "tick",
            0,
            "pk",
            "100",
            "a<b",
            &ChatOptions {
                anonymous: true,
                owner: true,
            },
        );
        assert!(frame.contains(" mail=\"184\""));
        assert!(frame.contains(" premium=\"1\""));
        assert!(frame.ends_with(">a&lt;b</chat>"));
        // Round-trips through the parser.
        let el = parse_frame(&frame).unwrap();
        assert_eq!(el.attr("mail"), "184");
        assert_eq!(el.body, "a<b");
    }

    #[test]
    fn test_body_entities_unescaped() {
        let el = parse_frame("<chat no=\"1\">&lt;tag&gt; &quot;q&quot; &apos;a&apos;</chat>")
            .unwrap();
        assert_eq!(el.body, "<tag> \"q\" 'a'");
    }

    #[test]
    fn test_attr_value_may_contain_angle_bracket() {
        let el = parse_frame("<chat mail=\"a&gt;b\" no=\"1\">x</chat>").unwrap();
        assert_eq!(el.attr("mail"), "a>b");
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_frame("no brackets at all").is_err());
        assert!(parse_frame("<chat no=\"1\">unterminated").is_err());
        assert!(parse_frame("<chat no=1>x</chat>").is_err());
        assert!(parse_frame("<>").is_err());
    }

    #[test]
    fn test_unknown_entity_passes_through() {
        let el = parse_frame("<chat no=\"1\">&#12354; &bogus;</chat>").unwrap();
        assert_eq!(el.body, "&#12354; &bogus;");
    }
}
