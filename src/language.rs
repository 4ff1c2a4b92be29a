//! Language registry: the target languages a landing page can be localized into.
//!
//! Initialized once on first access with `OnceLock` and immutable afterwards.

use std::sync::OnceLock;

/// One supported language.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// ISO 639-1 code, optionally with a region (e.g. "es", "pt-BR")
    pub code: &'static str,

    /// English name (e.g. "Spanish")
    pub name: &'static str,

    /// Native name (e.g. "Español")
    pub native_name: &'static str,

    /// Whether this is the source language pages are authored in
    pub is_source: bool,

    /// Whether this language can be targeted
    pub enabled: bool,
}

pub struct LanguageRegistry {
    languages: Vec<LanguageConfig>,
}

static REGISTRY: OnceLock<LanguageRegistry> = OnceLock::new();

impl LanguageRegistry {
    /// Get the global language registry instance.
    pub fn get() -> &'static LanguageRegistry {
        REGISTRY.get_or_init(|| LanguageRegistry {
            languages: default_languages(),
        })
    }

    /// Look up a language by code. Matching ignores ASCII case.
    pub fn get_by_code(&self, code: &str) -> Option<&LanguageConfig> {
        self.languages
            .iter()
            .find(|lang| lang.code.eq_ignore_ascii_case(code))
    }

    /// Languages a page can be translated into.
    pub fn list_targets(&self) -> Vec<&LanguageConfig> {
        self.languages
            .iter()
            .filter(|lang| lang.enabled && !lang.is_source)
            .collect()
    }

    /// Resolve configured target codes, rejecting unknown, disabled and
    /// duplicate entries. Returns the canonical codes in input order.
    pub fn resolve_targets<'a, I>(&self, codes: I) -> Result<Vec<&'static str>, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolved: Vec<&'static str> = Vec::new();
        for code in codes {
            let lang = self
                .get_by_code(code)
                .ok_or_else(|| format!("Unsupported language '{}'", code))?;
            if lang.is_source {
                return Err(format!("'{}' is the source language", lang.code));
            }
            if !lang.enabled {
                return Err(format!("Language '{}' is disabled", lang.code));
            }
            if resolved.contains(&lang.code) {
                return Err(format!("Language '{}' listed twice", lang.code));
            }
            resolved.push(lang.code);
        }
        Ok(resolved)
    }
}

fn lang(
    code: &'static str,
    name: &'static str,
    native_name: &'static str,
) -> LanguageConfig {
    LanguageConfig {
        code,
        name,
        native_name,
        is_source: false,
        enabled: true,
    }
}

fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            is_source: true,
            ..lang("en", "English", "English")
        },
        lang("es", "Spanish", "Español"),
        lang("fr", "French", "Français"),
        lang("de", "German", "Deutsch"),
        lang("it", "Italian", "Italiano"),
        lang("pt", "Portuguese", "Português"),
        lang("pt-BR", "Brazilian Portuguese", "Português do Brasil"),
        lang("nl", "Dutch", "Nederlands"),
        lang("pl", "Polish", "Polski"),
        lang("sv", "Swedish", "Svenska"),
        lang("ja", "Japanese", "日本語"),
        lang("ko", "Korean", "한국어"),
        lang("zh", "Chinese (Simplified)", "简体中文"),
        lang("ar", "Arabic", "العربية"),
        lang("tr", "Turkish", "Türkçe"),
    ]
}
