use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Placeholder syntax: `{{ env.NAME }}` or `{{ env.NAME | default("value") }}`
fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\)\s*)?\}\}"#).expect("valid placeholder regex")
    })
}

/// Substitute environment placeholders in raw config text
///
/// Runs before TOML parsing so secrets and paths can come from the
/// deployment environment. Comment lines are left untouched, so commented-out
/// examples never require their variables to be set.
pub(crate) fn expand_env(input: &str) -> anyhow::Result<String> {
    let mut output = String::with_capacity(input.len());
    for line in input.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            output.push_str(line);
        } else {
            output.push_str(&expand_line(line)?);
        }
    }
    Ok(output)
}

fn expand_line(line: &str) -> anyhow::Result<String> {
    let mut failure = None;
    let expanded = placeholder().replace_all(line, |caps: &Captures<'_>| {
        match resolve(&caps[1], caps.get(2).map(|m| m.as_str())) {
            Ok(value) => value,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(expanded.into_owned()),
    }
}

fn resolve(key: &str, default: Option<&str>) -> anyhow::Result<String> {
    let Some(name) = key.strip_prefix("env.").filter(|n| !n.is_empty() && !n.contains('.')) else {
        anyhow::bail!("unsupported placeholder `{key}`: only `env.NAME` is allowed");
    };
    match (std::env::var(name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_owned()),
        (Err(_), None) => anyhow::bail!("environment variable `{name}` is not set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_plain_text_through() {
        let input = "[snapshot]\nttl = \"5s\"\n";
        assert_eq!(expand_env(input).unwrap(), input);
    }

    #[test]
    fn substitutes_variables() {
        temp_env::with_vars([("CONDUIT_DB", Some("/var/lib/conduit.db"))], || {
            let out = expand_env("path = \"{{ env.CONDUIT_DB }}\"").unwrap();
            insta::assert_snapshot!(out, @r#"path = "/var/lib/conduit.db""#);
        });
    }

    #[test]
    fn falls_back_to_default() {
        temp_env::with_var_unset("CONDUIT_POLL", || {
            let out = expand_env("poll_interval = \"{{ env.CONDUIT_POLL | default(\"1s\") }}\"").unwrap();
            assert_eq!(out, "poll_interval = \"1s\"");
        });
    }

    #[test]
    fn missing_variable_is_an_error() {
        temp_env::with_var_unset("CONDUIT_SECRET", || {
            let err = expand_env("secret = \"{{ env.CONDUIT_SECRET }}\"").unwrap_err();
            assert!(err.to_string().contains("CONDUIT_SECRET"));
        });
    }

    #[test]
    fn rejects_other_scopes() {
        let err = expand_env("x = \"{{ vault.KEY }}\"").unwrap_err();
        assert!(err.to_string().contains("only `env.NAME`"));
    }

    #[test]
    fn comment_lines_are_not_expanded() {
        temp_env::with_var_unset("CONDUIT_UNSET", || {
            let input = "# secret = \"{{ env.CONDUIT_UNSET }}\"\nkind = \"memory\"";
            assert_eq!(expand_env(input).unwrap(), input);
        });
    }
}
