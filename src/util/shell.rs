//! Quoting of values interpolated into remote POSIX shell commands.

/// Quotes `value` for a POSIX shell.
///
/// Values made up of unambiguous characters are returned as is, everything
/// else is wrapped in single quotes.
pub fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@,+%".contains(&b));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Like [quote], but keeps a leading `~/` expandable to the remote home directory.
pub fn quote_path(path: &str) -> String {
    if path == "~" {
        "\"$HOME\"".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("\"$HOME\"/{}", quote(rest))
    } else {
        quote(path)
    }
}
