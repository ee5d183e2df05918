/// Split a `key:value` directive on its first colon only, so a value containing further
/// colons (a URL, a timestamp) survives intact. Surrounding whitespace around both halves
/// is trimmed.
pub fn parse_directive(directive: &str) -> Option<(String, String)> {
    let (key, value) = directive.split_once(':')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
