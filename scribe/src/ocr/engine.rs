use image::DynamicImage;

use crate::error::Result;
use crate::models::Token;

/// Raw output of one recognition call, before frame bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub tokens: Vec<Token>,
}

/// A single, non-reentrant recognition engine instance.
///
/// Instances are used from one blocking thread at a time and may keep
/// expensive state (loaded language models) between calls.
pub trait RecognitionEngine: Send + 'static {
    fn recognize(&mut self, image: &DynamicImage, languages: &[String]) -> Result<EngineOutput>;
}

/// Builds engine instances for the pool on demand.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn RecognitionEngine>>;
}

/// Language packs requested for one extraction, e.g. `eng+deu`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageHints(Vec<String>);

impl LanguageHints {
    /// Parse `+` or `,` separated pack names. Blank entries are dropped.
    pub fn parse(raw: &str) -> Self {
        let mut packs: Vec<String> = Vec::new();
        for pack in raw.split(['+', ',']) {
            let pack = pack.trim().to_lowercase();
            if !pack.is_empty() && !packs.contains(&pack) {
                packs.push(pack);
            }
        }
        Self(packs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Hinted packs that are actually installed, falling back to every
    /// configured pack when none of the hints apply.
    pub fn resolve(&self, configured: &[String]) -> Vec<String> {
        let selected: Vec<String> = self
            .0
            .iter()
            .filter(|pack| configured.contains(pack))
            .cloned()
            .collect();
        if selected.is_empty() {
            configured.to_vec()
        } else {
            selected
        }
    }
}
