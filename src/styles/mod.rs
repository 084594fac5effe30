//! Style profiles: style key → prompt pair, with a guaranteed default

pub mod prompt_engine;

pub use prompt_engine::{synthesize_prompt, CategoryContext, DEFAULT_BASE_STYLE};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AdGenError, Result};

pub const DEFAULT_STYLE: &str = "minimal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub key: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    /// Control-signal weight used when a request does not set one
    #[serde(default = "default_conditioning_scale")]
    pub conditioning_scale: f32,
}

fn default_conditioning_scale() -> f32 {
    0.5
}

/// Resolved text conditioning for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

/// Built-in table: (key, positive, negative, conditioning scale)
const BUILTIN_PROFILES: &[(&str, &str, &str, f32)] = &[
    (
        "minimal",
        "minimalist background, clean lines, solid soft colors, high quality, studio lighting, \
         product photography, 8k uhd, soft shadows, neutral tones, simple composition, professional",
        "cluttered, messy, distracting elements, harsh shadows, complex patterns, bright neon, \
         low quality, grainy, distorted",
        0.5,
    ),
    (
        "emotional",
        "warm atmosphere, soft sunlight, nature elements, cozy vibe, lifestyle photography, \
         depth of field, golden hour, emotional, cinematic lighting, 8k, highly detailed",
        "cold, sterile, artificial lighting, flat, cartoon, sketch, monochrome, low resolution, \
         ugly, blurry",
        0.7,
    ),
    (
        "street",
        "urban street style, concrete texture, city background, vibrant colors, hip hop vibe, \
         neon lights, high contrast, dynamic lighting, fashion photography, trendy, sharp",
        "rural, rustic, vintage, soft, pastel, plain, studio background, boring, dull, low quality",
        0.8,
    ),
];

/// Front-end style names mapped onto the built-in profiles
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("vintage", "emotional"),
    ("modern", "street"),
    ("natural", "emotional"),
    ("luxury", "minimal"),
    ("mood", "emotional"),
];

/// Immutable key → profile mapping. Lookup is case-insensitive and total.
#[derive(Debug, Clone)]
pub struct StyleRegistry {
    profiles: HashMap<String, StyleProfile>,
    aliases: HashMap<String, String>,
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}

impl StyleRegistry {
    pub fn builtin() -> Self {
        let profiles = BUILTIN_PROFILES
            .iter()
            .map(|(key, positive, negative, scale)| {
                (
                    key.to_string(),
                    StyleProfile {
                        key: key.to_string(),
                        positive_prompt: positive.to_string(),
                        negative_prompt: negative.to_string(),
                        conditioning_scale: *scale,
                    },
                )
            })
            .collect();
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(alias, target)| (alias.to_string(), target.to_string()))
            .collect();
        Self { profiles, aliases }
    }

    /// Built-in table with extra or replacement profiles merged on top
    pub fn with_profiles(extra: &[StyleProfile]) -> Result<Self> {
        let mut registry = Self::builtin();
        for profile in extra {
            let key = normalize(&profile.key);
            if key.is_empty() {
                return Err(AdGenError::config("style profile key must not be empty"));
            }
            if profile.positive_prompt.trim().is_empty() {
                return Err(AdGenError::config(format!(
                    "style profile '{}' has an empty positive prompt",
                    key
                )));
            }
            if !(0.0..=2.0).contains(&profile.conditioning_scale) {
                return Err(AdGenError::config(format!(
                    "style profile '{}' conditioning scale {} is outside [0, 2]",
                    key, profile.conditioning_scale
                )));
            }
            // an explicit profile shadows an alias of the same name
            registry.aliases.remove(&key);
            registry.profiles.insert(
                key.clone(),
                StyleProfile {
                    key,
                    ..profile.clone()
                },
            );
        }
        Ok(registry)
    }

    /// Canonical profile key for any input; unknown keys map to the default
    pub fn resolve_key(&self, key: &str) -> &str {
        let key = normalize(key);
        if let Some((k, _)) = self.profiles.get_key_value(&key) {
            return k;
        }
        if let Some(target) = self.aliases.get(&key) {
            if let Some((k, _)) = self.profiles.get_key_value(target) {
                return k;
            }
        }
        debug!("Unknown style '{}', using {}", key, DEFAULT_STYLE);
        DEFAULT_STYLE
    }

    pub fn get_profile(&self, key: &str) -> &StyleProfile {
        let resolved = self.resolve_key(key);
        &self.profiles[resolved]
    }

    pub fn default_profile(&self) -> &StyleProfile {
        &self.profiles[DEFAULT_STYLE]
    }

    /// Profile prompts with request free text prefixed, `", "` separated
    pub fn resolve_prompt_pair(
        &self,
        key: &str,
        extra_positive: Option<&str>,
        extra_negative: Option<&str>,
    ) -> PromptPair {
        let profile = self.get_profile(key);
        PromptPair {
            positive: join_prompt(extra_positive, &profile.positive_prompt),
            negative: join_prompt(extra_negative, &profile.negative_prompt),
        }
    }

    /// Sorted profile keys
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn join_prompt(extra: Option<&str>, base: &str) -> String {
    match extra.map(str::trim).filter(|s| !s.is_empty()) {
        Some(extra) if base.is_empty() => extra.to_string(),
        Some(extra) => format!("{}, {}", extra, base),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = StyleRegistry::builtin();
        assert_eq!(registry.get_profile("EMOTIONAL").key, "emotional");
        assert_eq!(registry.get_profile("  Street ").key, "street");
    }

    #[test]
    fn test_unknown_key_matches_default() {
        let registry = StyleRegistry::builtin();
        for key in ["", "does-not-exist", "ミニマル", "minimal!"] {
            assert_eq!(registry.get_profile(key), registry.get_profile(DEFAULT_STYLE));
        }
        assert!(registry.default_profile().positive_prompt.contains("minimalist"));
    }

    #[test]
    fn test_every_profile_has_prompts_and_scale() {
        let registry = StyleRegistry::builtin();
        assert_eq!(registry.keys(), vec!["emotional", "minimal", "street"]);
        for key in registry.keys() {
            let profile = registry.get_profile(key);
            assert!(!profile.positive_prompt.is_empty());
            assert!((0.5..=1.0).contains(&profile.conditioning_scale));
        }
    }

    #[test]
    fn test_aliases() {
        let registry = StyleRegistry::builtin();
        assert_eq!(registry.resolve_key("Vintage"), "emotional");
        assert_eq!(registry.resolve_key("modern"), "street");
        assert_eq!(registry.resolve_key("luxury"), "minimal");
        assert_eq!(registry.resolve_key("mood"), "emotional");
    }

    #[test]
    fn test_prompt_pair_prefixes_free_text() {
        let registry = StyleRegistry::builtin();
        let pair = registry.resolve_prompt_pair("street", Some("red sneakers"), Some("  "));
        assert!(pair.positive.starts_with("red sneakers, urban street style"));
        assert_eq!(pair.negative, registry.get_profile("street").negative_prompt);

        let plain = registry.resolve_prompt_pair("street", None, Some("text, watermark"));
        assert!(plain.negative.starts_with("text, watermark, rural"));
    }

    #[test]
    fn test_extra_profiles_override_and_validate() -> anyhow::Result<()> {
        let custom = StyleProfile {
            key: "Luxury".to_string(),
            positive_prompt: "marble, gold accents".to_string(),
            negative_prompt: String::new(),
            conditioning_scale: 0.9,
        };
        let registry = StyleRegistry::with_profiles(&[custom])?;
        assert_eq!(registry.get_profile("luxury").positive_prompt, "marble, gold accents");
        assert_eq!(registry.resolve_key("LUXURY"), "luxury");

        let broken = StyleProfile {
            key: "empty".to_string(),
            positive_prompt: " ".to_string(),
            negative_prompt: String::new(),
            conditioning_scale: 0.5,
        };
        assert!(StyleRegistry::with_profiles(&[broken]).is_err());
        Ok(())
    }
}
