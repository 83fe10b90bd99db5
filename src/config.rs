//! Configuration resolution for the optional OpenAI collaborator.
//!
//! Precedence: CLI overrides > environment (`QPG_OPENAI_*`, then `OPENAI_*`)
//! > YAML config file > built-in defaults. The config file is YAML with flat
//! keys; a `KEY=VALUE` dotenv-style file is accepted as a fallback format.

use std::collections::HashMap;
use std::path::Path;

use crate::dsn::redact_secret;
use crate::paths::config_yaml_path;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-5-nano";

/// Effective OpenAI settings after precedence merging.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl OpenAiSettings {
    /// Display form of the API key; never the raw secret.
    pub fn api_key_redacted(&self) -> Option<String> {
        self.api_key.as_deref().map(redact_secret)
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Heuristic from the file contents: a dotenv file's first significant line
/// is `KEY=VALUE` with no `:` in the key.
fn looks_like_dotenv(text: &str) -> bool {
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        return match line.split_once('=') {
            Some((key, _)) => !key.contains(':'),
            None => false,
        };
    }
    false
}

fn parse_dotenv(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            values.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
    }
    values
}

fn parse_yaml(text: &str) -> HashMap<String, String> {
    let parsed: HashMap<String, serde_yaml::Value> = match serde_yaml::from_str(text) {
        Ok(map) => map,
        Err(_) => return HashMap::new(),
    };
    parsed
        .into_iter()
        .filter_map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.to_ascii_lowercase(), text))
        })
        .collect()
}

/// Parse the config file contents, accepting YAML or dotenv syntax.
pub fn parse_config_text(text: &str) -> HashMap<String, String> {
    if looks_like_dotenv(text) {
        parse_dotenv(text)
    } else {
        parse_yaml(text)
    }
}

fn load_config_file(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config_text(&text),
        Err(_) => HashMap::new(),
    }
}

fn resolve_with(
    file: &HashMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
    api_key_override: Option<String>,
    base_url_override: Option<String>,
    model_override: Option<String>,
) -> OpenAiSettings {
    let env_value = |names: &[&str]| -> Option<String> {
        names.iter().find_map(|name| clean(env(name)))
    };
    let file_value = |key: &str| clean(file.get(key).cloned());

    let api_key = clean(api_key_override)
        .or_else(|| env_value(&["QPG_OPENAI_API_KEY", "OPENAI_API_KEY"]))
        .or_else(|| file_value("openai_api_key"));
    let base_url = clean(base_url_override)
        .or_else(|| env_value(&["QPG_OPENAI_BASE_URL", "OPENAI_BASE_URL"]))
        .or_else(|| file_value("openai_base_url"))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let model = clean(model_override)
        .or_else(|| env_value(&["QPG_OPENAI_MODEL", "OPENAI_MODEL"]))
        .or_else(|| file_value("openai_model"))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    OpenAiSettings {
        api_key,
        base_url,
        model,
    }
}

/// Resolve the effective OpenAI settings from all configuration layers.
pub fn resolve_openai_settings(
    api_key_override: Option<String>,
    base_url_override: Option<String>,
    model_override: Option<String>,
) -> OpenAiSettings {
    let file = load_config_file(&config_yaml_path());
    resolve_with(
        &file,
        |name| std::env::var(name).ok(),
        api_key_override,
        base_url_override,
        model_override,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn yaml_config_is_parsed() {
        let values = parse_config_text("openai_api_key: sk-test\nopenai_model: gpt-4o-mini\n");
        assert_eq!(values.get("openai_api_key").unwrap(), "sk-test");
        assert_eq!(values.get("openai_model").unwrap(), "gpt-4o-mini");
    }

    #[test]
    fn dotenv_fallback_is_parsed() {
        let values = parse_config_text("# comment\nOPENAI_API_KEY=sk-env\nOPENAI_MODEL=\"m\"\n");
        assert_eq!(values.get("openai_api_key").unwrap(), "sk-env");
        assert_eq!(values.get("openai_model").unwrap(), "m");
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let settings = resolve_with(&HashMap::new(), no_env, None, None, None);
        assert!(settings.api_key.is_none());
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn overrides_beat_env_and_file() {
        let file = parse_config_text("openai_model: from-file\n");
        let env = |name: &str| (name == "QPG_OPENAI_MODEL").then(|| "from-env".to_string());
        let settings = resolve_with(&file, env, None, None, Some("from-cli".into()));
        assert_eq!(settings.model, "from-cli");

        let settings = resolve_with(&file, env, None, None, None);
        assert_eq!(settings.model, "from-env");

        let settings = resolve_with(&file, no_env, None, None, None);
        assert_eq!(settings.model, "from-file");
    }

    #[test]
    fn qpg_env_beats_openai_alias() {
        let env = |name: &str| match name {
            "QPG_OPENAI_API_KEY" => Some("qpg-key".to_string()),
            "OPENAI_API_KEY" => Some("alias-key".to_string()),
            _ => None,
        };
        let settings = resolve_with(&HashMap::new(), env, None, None, None);
        assert_eq!(settings.api_key.as_deref(), Some("qpg-key"));
    }

    #[test]
    fn redacted_key_never_leaks() {
        let settings = OpenAiSettings {
            api_key: Some("sk-verysecretvalue".into()),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
        };
        let display = settings.api_key_redacted().unwrap();
        assert!(!display.contains("verysecret"));
    }
}
