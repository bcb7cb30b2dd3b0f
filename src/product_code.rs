use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("no product code found in `{0}`")]
    NotFound(String),
    #[error("no usable product code prefixes configured")]
    InvalidPrefixes,
}

/// Recognizes vendor product codes such as `NATBRA-108431` or `natbra108431`.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    pattern: Regex,
}

impl CodeExtractor {
    pub fn new(prefixes: &[String]) -> Result<Self, CodeError> {
        let mut usable: Vec<String> = prefixes
            .iter()
            .map(|p| p.trim().to_ascii_uppercase())
            .filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphabetic()))
            .collect();
        if usable.is_empty() {
            return Err(CodeError::InvalidPrefixes);
        }
        // Longer prefixes first so an extended prefix wins over its stem.
        usable.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        usable.dedup();
        let alternation = usable
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?i)(?:^|[^A-Za-z])({alternation})-?(\d+)"))
            .map_err(|_| CodeError::InvalidPrefixes)?;
        Ok(Self { pattern })
    }

    pub fn extract(&self, url: &str) -> Result<String, CodeError> {
        let caps = self
            .pattern
            .captures(url)
            .ok_or_else(|| CodeError::NotFound(url.to_string()))?;
        match (caps.get(1), caps.get(2)) {
            (Some(prefix), Some(digits)) => Ok(format!(
                "{}-{}",
                prefix.as_str().to_ascii_uppercase(),
                digits.as_str()
            )),
            _ => Err(CodeError::NotFound(url.to_string())),
        }
    }
}

/// Both spellings a code may take inside asset URLs, lowercased.
pub fn code_variants(code: &str) -> [String; 2] {
    let lower = code.to_ascii_lowercase();
    let compact = lower.replace('-', "");
    [lower, compact]
}
