//! IRCv3 message-tag parsing and escaping.

/// A single message tag: key and optional value.
///
/// Values are stored unescaped; escaping is applied on serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// Escape a tag value for the wire per the IRCv3 message-tags spec.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Unescape a tag value from wire format.
///
/// A trailing lone backslash is dropped, matching the spec's lenient rule.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        if c == '\\' {
            match iter.next() {
                Some(':') => out.push(';'),
                Some('s') => out.push(' '),
                Some('\\') => out.push('\\'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some(c) => out.push(c),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse the tags portion of a message (without the leading `@`).
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(|tag| {
            let mut iter = tag.splitn(2, '=');
            let key = iter.next().unwrap_or("").to_string();
            let value = iter.next().map(unescape_tag_value);
            Tag(key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let raw = "hi there; \\slash\r\n";
        assert_eq!(unescape_tag_value(&escape_tag_value(raw)), raw);
    }

    #[test]
    fn test_unescape_trailing_backslash() {
        assert_eq!(unescape_tag_value("abc\\"), "abc");
    }

    #[test]
    fn test_parse_tags_basic() {
        let tags = parse_tags("badges=moderator/1;mod=1;emotes=");
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0], Tag("badges".into(), Some("moderator/1".into())));
        assert_eq!(tags[1], Tag("mod".into(), Some("1".into())));
        assert_eq!(tags[2], Tag("emotes".into(), Some(String::new())));
    }

    #[test]
    fn test_parse_tags_valueless() {
        let tags = parse_tags("+typing;flag");
        assert_eq!(tags[0], Tag("+typing".into(), None));
        assert_eq!(tags[1], Tag("flag".into(), None));
    }

    #[test]
    fn test_parse_tags_escaped_value() {
        let tags = parse_tags("reason=busy\\sright\\snow");
        assert_eq!(tags[0].1.as_deref(), Some("busy right now"));
    }
}
