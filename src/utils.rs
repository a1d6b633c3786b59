/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let encoded = hex::encode_upper(bytes);
    let mut rendered = String::with_capacity(bytes.len().saturating_mul(3));
    for (index, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.extend(pair.iter().map(|&digit| char::from(digit)));
    }
    rendered
}

/// Returns the value as text when it is valid UTF-8 without control characters.
pub(crate) fn printable_text(bytes: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(bytes).ok()?;
    (!text.is_empty() && !text.chars().any(char::is_control)).then_some(text)
}
