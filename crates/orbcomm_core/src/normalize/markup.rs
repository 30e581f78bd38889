use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HIDDEN_BLOCK_RE: Regex =
        Regex::new(r"(?is)<!--.*?-->|<(script|style|head)\b[^>]*>.*?</(script|style|head)\s*>")
            .expect("hidden block regex must parse");
    static ref LINE_BREAK_TAG_RE: Regex = Regex::new(
        r"(?i)<br\s*/?>|</?(p|div|tr|li|ul|ol|table|tbody|thead|h[1-6]|blockquote)\b[^>]*>"
    )
    .expect("line break tag regex must parse");
    static ref CELL_TAG_RE: Regex =
        Regex::new(r"(?i)</(td|th)\s*>").expect("cell tag regex must parse");
    static ref ANY_TAG_RE: Regex =
        Regex::new(r"(?s)</?[A-Za-z!][^>]*>").expect("tag regex must parse");
    static ref HSPACE_RE: Regex = Regex::new(r"[ \t\f\v]+").expect("space regex must parse");
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&#xa0;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        // Last, so "&amp;nbsp;" decodes to the literal text "&nbsp;".
        .replace("&amp;", "&")
        .replace('\u{a0}', " ")
}

/// Render an email body as plain text lines.
///
/// Block-level markup becomes line breaks, table cells become spaces, everything else is
/// stripped, and blank lines are dropped. Plain-text bodies pass through with only
/// whitespace tidied, so label-based extraction works the same on both shapes of email.
pub fn body_to_text(body: &str) -> String {
    let without_hidden = HIDDEN_BLOCK_RE.replace_all(body, "");
    let with_breaks = LINE_BREAK_TAG_RE.replace_all(&without_hidden, "\n");
    let with_cells = CELL_TAG_RE.replace_all(&with_breaks, " ");
    let stripped = ANY_TAG_RE.replace_all(&with_cells, "");
    let decoded = decode_entities(&stripped);

    decoded
        .lines()
        .map(|line| HSPACE_RE.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn html_labels_become_lines() {
        let body = "<html><body>\n<p><b>Platform:</b>&nbsp;IDP</p><p><b>Start Time:</b>    &nbsp;   2025-10-20 10:00 GMT   </p></body></html>";
        assert_eq!(
            body_to_text(body),
            "Platform: IDP\nStart Time: 2025-10-20 10:00 GMT"
        );
    }

    #[test]
    fn table_cells_are_separated() {
        let body = "<table><tr><td>End Time:</td><td>2025-10-23 00:37 GMT</td></tr></table>";
        assert_eq!(body_to_text(body), "End Time: 2025-10-23 00:37 GMT");
    }

    #[test]
    fn plain_text_passes_through() {
        let body = "Platform: OGx\r\n\r\n\r\nSummary:  Dear Partner,\tthanks";
        assert_eq!(body_to_text(body), "Platform: OGx\nSummary: Dear Partner, thanks");
    }

    #[test]
    fn style_blocks_are_dropped() {
        let body = "<style>p { color: red; }</style><p>Status: Open</p>";
        assert_eq!(body_to_text(body), "Status: Open");
    }
}
