use std::path::Path;

/// quote a single word for POSIX shells, plain words are kept as is
pub fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }

    if word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,%".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

pub fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// turn an arbitrary component name into something usable inside a file name
pub fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
