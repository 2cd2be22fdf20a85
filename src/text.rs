// Display helpers for container names and log lines

/// Remove ANSI escape sequences from a string.
///
/// Handles CSI (`ESC [ ... m`), OSC (`ESC ] ...`) and charset (`ESC ( ...`)
/// sequences; a sequence ends at the first ASCII letter or `~`.
pub fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_escape = false;
    let mut escape_start = false;

    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
            escape_start = true;
            continue;
        }

        if in_escape {
            if escape_start && (c == '[' || c == ']' || c == '(') {
                escape_start = false;
                continue;
            }
            escape_start = false;

            if c.is_ascii_alphabetic() || c == '~' {
                in_escape = false;
            }
            continue;
        }

        result.push(c);
    }

    result
}

/// Display form of a container name. Demo mode hides the prefix up to the
/// first underscore (compose project names).
pub fn display_name(name: &str, demo_mode: bool) -> String {
    let name = name.trim_start_matches('/');
    if !demo_mode {
        return name.to_string();
    }
    match name.find('_') {
        Some(idx) => name[idx + 1..].to_string(),
        None => name.to_string(),
    }
}
