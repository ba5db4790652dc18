use std::sync::LazyLock;

use regex::Regex;

/// Placeholder pattern: `{{ env.VAR }}`, optionally `| default("...")`
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{\s*env\.([A-Za-z0-9_]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
        .expect("placeholder pattern is valid")
});

/// Expand `{{ env.VAR }}` placeholders in raw config text
///
/// Expansion happens before deserialization so config structs hold plain
/// `String`/`SecretString` values. TOML comment lines pass through
/// unchanged; a missing variable without a `default("...")` clause is an
/// error.
pub fn expand_env(input: &str) -> Result<String, String> {
    let mut output = String::with_capacity(input.len());

    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            output.push('\n');
        }

        if line.trim_start().starts_with('#') {
            output.push_str(line);
            continue;
        }

        let mut cursor = 0;
        for caps in PLACEHOLDER.captures_iter(line) {
            let span = caps.get(0).expect("whole match");
            output.push_str(&line[cursor..span.start()]);

            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => output.push_str(&value),
                Err(_) => match caps.get(2) {
                    Some(fallback) => output.push_str(fallback.as_str()),
                    None => return Err(format!("environment variable not found: `{var}`")),
                },
            }

            cursor = span.end();
        }
        output.push_str(&line[cursor..]);
    }

    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand_env("port = 3456").unwrap(), "port = 3456");
    }

    #[test]
    fn expands_set_variable() {
        temp_env::with_var("MANIFOLD_KEY", Some("sk-test"), || {
            let out = expand_env("api_key = \"{{ env.MANIFOLD_KEY }}\"").unwrap();
            assert_eq!(out, "api_key = \"sk-test\"");
        });
    }

    #[test]
    fn missing_variable_errors() {
        temp_env::with_var_unset("MANIFOLD_ABSENT", || {
            let err = expand_env("key = \"{{ env.MANIFOLD_ABSENT }}\"").unwrap_err();
            assert!(err.contains("MANIFOLD_ABSENT"));
        });
    }

    #[test]
    fn default_fills_missing_variable() {
        temp_env::with_var_unset("MANIFOLD_ABSENT", || {
            let out = expand_env("key = \"{{ env.MANIFOLD_ABSENT | default(\"local\") }}\"").unwrap();
            assert_eq!(out, "key = \"local\"");
        });
    }

    #[test]
    fn comment_lines_are_untouched() {
        temp_env::with_var_unset("MANIFOLD_ABSENT", || {
            let input = "# key = \"{{ env.MANIFOLD_ABSENT }}\"";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }

    #[test]
    fn trailing_newline_is_preserved() {
        assert_eq!(expand_env("a = 1\n").unwrap(), "a = 1\n");
    }
}
