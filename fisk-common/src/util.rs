//! Shared utilities for fisk.

/// Substrings of a `-D` macro name that mark its value as sensitive.
const SENSITIVE_MARKERS: [&str; 6] = [
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "API_KEY",
    "PRIVATE_KEY",
];

fn is_sensitive_define(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Mask the value of a `NAME=VALUE` define if `NAME` looks sensitive.
fn mask_define(define: &str) -> Option<String> {
    let (name, _) = define.split_once('=')?;
    is_sensitive_define(name).then(|| format!("{}=***", name))
}

fn quote(arg: &str) -> String {
    if arg.is_empty() {
        "''".to_string()
    } else if arg.chars().any(char::is_whitespace) {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Render a compiler command line for logging.
///
/// Values of `-DNAME=VALUE` and `-D NAME=VALUE` defines whose names look like
/// credentials are replaced with `***`. Arguments containing whitespace are
/// single-quoted.
pub fn mask_command_line<S: AsRef<str>>(args: &[S]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut define_follows = false;
    for arg in args {
        let arg = arg.as_ref();
        let rendered = if define_follows {
            define_follows = false;
            mask_define(arg).unwrap_or_else(|| arg.to_string())
        } else if arg == "-D" {
            define_follows = true;
            arg.to_string()
        } else if let Some(define) = arg.strip_prefix("-D") {
            mask_define(define)
                .map(|masked| format!("-D{}", masked))
                .unwrap_or_else(|| arg.to_string())
        } else {
            arg.to_string()
        };
        out.push(quote(&rendered));
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_attached_define() {
        let masked = mask_command_line(&["gcc", "-DAPI_KEY=abc123", "-DNDEBUG", "-c", "a.c"]);
        assert_eq!(masked, "gcc -DAPI_KEY=*** -DNDEBUG -c a.c");
        assert!(!masked.contains("abc123"));
    }

    #[test]
    fn test_mask_separate_define() {
        let masked = mask_command_line(&["cc", "-D", "github_token=xyz", "-D", "VERSION=3"]);
        assert_eq!(masked, "cc -D github_token=*** -D VERSION=3");
    }

    #[test]
    fn test_mask_leaves_other_flags() {
        let masked = mask_command_line(&["cc", "-o", "secret.o", "--password=x"]);
        assert_eq!(masked, "cc -o secret.o --password=x");
    }

    #[test]
    fn test_quotes_whitespace() {
        let masked = mask_command_line(&["cc", "-DMSG=hello world", "it's here"]);
        assert_eq!(masked, r"cc '-DMSG=hello world' 'it'\''s here'");
    }

    #[test]
    fn test_empty_command_line() {
        let empty: [&str; 0] = [];
        assert_eq!(mask_command_line(&empty), "");
        assert_eq!(mask_command_line(&["cc", ""]), "cc ''");
    }
}
