//! Language registry: maps a language identifier to the runtime needed to
//! compile and run it inside the sandbox.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;

/// A supported language and the container runtime that executes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Language {
    /// Short identifier used in requests (e.g. "python")
    pub id: String,
    /// Display name (e.g. "Python")
    pub name: String,
    /// Container image the program runs in
    pub image: String,
    /// Name of the source file inside the sandbox (e.g. "solution.py")
    pub source_file: String,
    /// Compile command; empty for interpreted languages
    pub compile_cmd: Vec<String>,
    /// Run command
    pub run_cmd: Vec<String>,
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        !self.compile_cmd.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("language not found: {0}")]
pub struct LanguageNotFound(pub String);

/// Raw TOML entry for a language
#[derive(Debug, Deserialize)]
struct RawLanguage {
    name: String,
    image: String,
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
}

/// Read-mostly registry of supported languages. Writes happen at startup;
/// lookups are concurrent and never block one another.
#[derive(Debug)]
pub struct Registry {
    languages: RwLock<HashMap<String, Language>>,
}

impl Registry {
    /// Empty registry, no languages preloaded.
    pub fn new() -> Self {
        Self {
            languages: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the default language table.
    pub fn with_defaults() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        let raw: HashMap<String, RawLanguage> = toml::from_str(content)?;

        let registry = Self::new();
        for (id, raw) in raw {
            registry.register(Language {
                id: id.to_lowercase(),
                name: raw.name,
                image: raw.image,
                source_file: raw.source_file,
                compile_cmd: raw
                    .compile_command
                    .map(|cmd| into_command(&cmd))
                    .unwrap_or_default(),
                run_cmd: into_command(&raw.run_command),
            });
        }
        Ok(registry)
    }

    /// Insert or overwrite a language.
    pub fn register(&self, lang: Language) {
        let mut languages = self.languages.write().unwrap_or_else(|e| e.into_inner());
        languages.insert(lang.id.clone(), lang);
    }

    /// Look up a language by identifier (case-insensitive).
    pub fn get(&self, id: &str) -> Result<Language, LanguageNotFound> {
        let languages = self.languages.read().unwrap_or_else(|e| e.into_inner());
        languages
            .get(&id.to_lowercase())
            .cloned()
            .ok_or_else(|| LanguageNotFound(id.to_string()))
    }

    /// All registered languages, in unspecified order.
    pub fn list(&self) -> Vec<Language> {
        let languages = self.languages.read().unwrap_or_else(|e| e.into_inner());
        languages.values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_compiled_and_interpreted() {
        let registry = Registry::with_defaults().unwrap();

        let cpp = registry.get("cpp").unwrap();
        assert!(cpp.is_compiled());
        assert_eq!(cpp.image, "gcc:13");
        assert_eq!(cpp.source_file, "solution.cpp");
        assert_eq!(cpp.run_cmd, vec!["./solution"]);

        let python = registry.get("python").unwrap();
        assert!(!python.is_compiled());
        assert_eq!(python.run_cmd, vec!["python", "solution.py"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = Registry::with_defaults().unwrap();
        assert_eq!(registry.get("Python").unwrap().id, "python");
    }

    #[test]
    fn unknown_language_is_an_error() {
        let registry = Registry::with_defaults().unwrap();
        let err = registry.get("ruby").unwrap_err();
        assert_eq!(err.to_string(), "language not found: ruby");
    }

    #[test]
    fn register_overwrites_existing_entry() {
        let registry = Registry::with_defaults().unwrap();
        let mut python = registry.get("python").unwrap();
        python.image = "python:3.12-slim".into();
        registry.register(python);
        assert_eq!(registry.get("python").unwrap().image, "python:3.12-slim");
    }

    #[test]
    fn list_returns_all_defaults() {
        let registry = Registry::with_defaults().unwrap();
        let mut ids: Vec<String> = registry.list().into_iter().map(|l| l.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["cpp", "javascript", "python", "typescript"]);
    }
}
