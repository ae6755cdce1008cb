//! Scanner page rendering.

const SCANNER_TEMPLATE: &str = include_str!("../../assets/scanner.html");
const PLACEHOLDER: &str = "{{qr_data_uri}}";

/// Render the scanner page around a `data:` URI.
pub fn render_scanner(data_uri: &str) -> String {
    SCANNER_TEMPLATE.replace(PLACEHOLDER, &escape_attr(data_uri))
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
