//! Category-aware prompt synthesis
//!
//! A small rule table maps a product category to season, vibe and keywords,
//! which are folded into one descriptive sentence. Pure and deterministic.

use serde::Serialize;

pub const DEFAULT_BASE_STYLE: &str = "instagram";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryContext {
    pub season: &'static str,
    pub vibe: &'static str,
    pub keywords: &'static str,
}

const CATEGORY_CONTEXTS: &[(&str, CategoryContext)] = &[
    (
        "cardigan",
        CategoryContext {
            season: "autumn",
            vibe: "cozy, warm lighting, cafe",
            keywords: "soft wool, knitwear",
        },
    ),
    (
        "vest",
        CategoryContext {
            season: "business",
            vibe: "professional, office window, city skyline",
            keywords: "suit vest, formal",
        },
    ),
    (
        "dress",
        CategoryContext {
            season: "spring",
            vibe: "garden, flowers, sunlight",
            keywords: "elegant, flowy fabric",
        },
    ),
];

const FALLBACK_CONTEXT: CategoryContext = CategoryContext {
    season: "neutral",
    vibe: "studio minimal",
    keywords: "fashion item",
};

/// Context for a category, case-insensitive, with a neutral fallback
pub fn category_context(category: &str) -> CategoryContext {
    let category = category.trim().to_lowercase();
    CATEGORY_CONTEXTS
        .iter()
        .find(|(key, _)| *key == category)
        .map(|(_, ctx)| *ctx)
        .unwrap_or(FALLBACK_CONTEXT)
}

/// Build the dynamic prompt. `base_style` defaults to [`DEFAULT_BASE_STYLE`].
pub fn synthesize_prompt(category: &str, base_style: Option<&str>) -> String {
    let ctx = category_context(category);
    let base_style = base_style
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_BASE_STYLE);
    format!(
        "high fashion photography of a {}, {}, wearing by a model, {}, {} atmosphere, \
         highly detailed, 8k resolution, {} aesthetic",
        category.trim(),
        ctx.keywords,
        ctx.vibe,
        ctx.season,
        base_style
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_category() {
        let prompt = synthesize_prompt("Cardigan", None);
        assert_eq!(
            prompt,
            "high fashion photography of a Cardigan, soft wool, knitwear, wearing by a model, \
             cozy, warm lighting, cafe, autumn atmosphere, highly detailed, 8k resolution, \
             instagram aesthetic"
        );
    }

    #[test]
    fn test_unknown_category_uses_fallback() {
        let prompt = synthesize_prompt("scarf", Some("editorial"));
        assert!(prompt.contains("fashion item"));
        assert!(prompt.contains("studio minimal"));
        assert!(prompt.contains("neutral atmosphere"));
        assert!(prompt.ends_with("editorial aesthetic"));
    }

    #[test]
    fn test_synthesis_is_pure() {
        for category in ["vest", "DRESS", "", "unknown"] {
            assert_eq!(
                synthesize_prompt(category, Some("vogue")),
                synthesize_prompt(category, Some("vogue"))
            );
        }
        assert_eq!(category_context("VEST").season, "business");
    }
}
