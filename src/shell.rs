// POSIX sh quoting for command strings we send to the remote shell.

const SHELL_META: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}', '<',
    '>', '|', '&', ';', '#', '~',
];

// Always wrap in single quotes. Embedded `'` becomes `'\''`.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

// Quote only if needed, keeps logged command lines readable.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }
    quote(arg)
}

// Like quote(), but a leading `~` still expands to the remote home
pub fn quote_remote_path(path: &str) -> String {
    if path == "~" {
        return "\"$HOME\"".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", quote(rest)),
        None => quote(path),
    }
}

pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote_arg(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
