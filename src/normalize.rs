use anyhow::{Context, Result};
use regex::Regex;

/// Canonicalization policy applied to reference and hypothesis transcripts
/// before alignment. The same normalizer instance must be used for both
/// sides of a comparison; any asymmetry is a correctness bug.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub lowercase: bool,
    /// Remove bracketed annotation spans such as `[noise]` or `[laughter]`.
    pub strip_tags: bool,
    pub expand_contractions: bool,
    pub remove_punct: bool,
    /// Restrict punctuation removal to this character set instead of the
    /// default "everything non-alphanumeric, non-whitespace" rule.
    pub punctuation: Option<String>,
    pub remove_numbers: bool,
    pub collapse_whitespace: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            lowercase: true,
            strip_tags: true,
            expand_contractions: true,
            remove_punct: true,
            punctuation: None,
            remove_numbers: false,
            collapse_whitespace: true,
        }
    }
}

pub struct Normalizer {
    options: NormalizeOptions,
    tag_pattern: Regex,
    number_pattern: Regex,
    whitespace_pattern: Regex,
    contractions: Vec<(Regex, &'static str)>,
}

/// Contraction expansions applied in order; the specific forms come before
/// the generic suffixes so that e.g. `won't` never reaches the `n't` rule.
const CONTRACTIONS: &[(&str, &str)] = &[
    (r"(?i)\bwon't\b", "will not"),
    (r"(?i)\bcan't\b", "can not"),
    (r"(?i)\blet's\b", "let us"),
    (r"(?i)n't\b", " not"),
    (r"(?i)'re\b", " are"),
    (r"(?i)'ve\b", " have"),
    (r"(?i)'ll\b", " will"),
    (r"(?i)'d\b", " would"),
    (r"(?i)'m\b", " am"),
    (r"(?i)'s\b", " is"),
];

impl Normalizer {
    pub fn new(options: NormalizeOptions) -> Result<Self> {
        let contractions = CONTRACTIONS
            .iter()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|re| (re, *replacement))
                    .with_context(|| format!("invalid contraction pattern: {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            options,
            tag_pattern: Regex::new(r"\[[^\[\]]*\]").context("invalid tag pattern")?,
            number_pattern: Regex::new(r"\d+").context("invalid number pattern")?,
            whitespace_pattern: Regex::new(r"\s+").context("invalid whitespace pattern")?,
            contractions,
        })
    }

    /// Pure and deterministic; normalizing twice yields the same string as
    /// normalizing once.
    pub fn normalize(&self, text: &str) -> String {
        let mut text = text.to_string();

        if self.options.strip_tags {
            text = self.tag_pattern.replace_all(&text, " ").into_owned();
        }

        if self.options.expand_contractions {
            for (pattern, replacement) in &self.contractions {
                text = pattern.replace_all(&text, *replacement).into_owned();
            }
        }

        if self.options.lowercase {
            text = text.to_lowercase();
        }

        if self.options.remove_numbers {
            text = self.number_pattern.replace_all(&text, "").into_owned();
        }

        if self.options.remove_punct {
            text = match &self.options.punctuation {
                Some(set) => text.chars().filter(|c| !set.contains(*c)).collect(),
                None => text
                    .chars()
                    .filter(|c| c.is_alphanumeric() || c.is_whitespace())
                    .collect(),
            };
        }

        if self.options.collapse_whitespace {
            text = self
                .whitespace_pattern
                .replace_all(text.trim(), " ")
                .into_owned();
        }

        text
    }
}
