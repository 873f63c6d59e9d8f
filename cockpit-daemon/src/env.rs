use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Pre-compiled regex for environment variable expansion
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").unwrap()
});

/// Pre-compiled regex for model template placeholders (`{{ model }}`)
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap()
});

/// Expand ${VAR} references in a string using extra env first, then the daemon environment.
/// Unset variables expand to the empty string.
pub fn expand_env(s: &str, extra_env: &HashMap<String, String>) -> String {
    ENV_VAR_REGEX
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            extra_env
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Names of all `{{ name }}` placeholders in a string, in order of appearance
pub fn template_placeholders(s: &str) -> Vec<String> {
    TEMPLATE_REGEX
        .captures_iter(s)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute `{{ name }}` placeholders. Fails on the first placeholder without a value.
pub fn render_template(s: &str, vars: &HashMap<String, String>) -> std::result::Result<String, String> {
    let mut missing = None;
    let rendered = TEMPLATE_REGEX.replace_all(s, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(format!("no value for placeholder '{}'", key)),
        None => Ok(rendered.into_owned()),
    }
}

/// Build the full environment for a service process.
///
/// The daemon's own environment is inherited; service overrides are rendered
/// against the model placeholders and then `${VAR}`-expanded.
pub fn build_service_env(
    overrides: &std::collections::BTreeMap<String, String>,
    vars: &HashMap<String, String>,
) -> std::result::Result<HashMap<String, String>, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    for (key, value) in overrides {
        let rendered = render_template(value, vars)?;
        let expanded = expand_env(&rendered, &env);
        env.insert(key.clone(), expanded);
    }

    Ok(env)
}
