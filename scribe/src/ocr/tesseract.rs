use image::DynamicImage;
use leptess::{LepTess, Variable};
use tracing::{debug, info};

use super::engine::{EngineFactory, EngineOutput, RecognitionEngine};
use super::preprocessing::encode_png;
use crate::config::OcrConfig;
use crate::error::{Result, ScribeError};
use crate::models::{BoundingBox, Token};

/// Tesseract instance bound to one language set. Switching languages
/// reinitializes the underlying API.
pub struct TesseractEngine {
    lt: LepTess,
    loaded: Vec<String>,
    datapath: Option<String>,
    page_seg_mode: String,
    source_dpi: i32,
}

fn init(datapath: Option<&str>, languages: &[String]) -> Result<LepTess> {
    LepTess::new(datapath, &languages.join("+")).map_err(|e| {
        ScribeError::EngineUnavailable(format!(
            "tesseract init failed for '{}': {e}",
            languages.join("+")
        ))
    })
}

impl TesseractEngine {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let lt = init(config.datapath.as_deref(), &config.languages)?;
        Ok(Self {
            lt,
            loaded: config.languages.clone(),
            datapath: config.datapath.clone(),
            page_seg_mode: config.page_seg_mode.to_string(),
            source_dpi: config.source_dpi,
        })
    }

    fn ensure_languages(&mut self, languages: &[String]) -> Result<()> {
        if languages.is_empty() || self.loaded == languages {
            return Ok(());
        }
        debug!(languages = %languages.join("+"), "Reloading tesseract languages");
        self.lt = init(self.datapath.as_deref(), languages)?;
        self.loaded = languages.to_vec();
        Ok(())
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(&mut self, image: &DynamicImage, languages: &[String]) -> Result<EngineOutput> {
        self.ensure_languages(languages)?;

        self.lt
            .set_variable(Variable::TesseditPagesegMode, &self.page_seg_mode)
            .map_err(|e| ScribeError::EngineFailure(format!("set page segmentation: {e}")))?;

        let png = encode_png(image)?;
        self.lt
            .set_image_from_mem(&png)
            .map_err(|e| ScribeError::EngineFailure(format!("load image: {e}")))?;
        self.lt.set_source_resolution(self.source_dpi);

        let tsv = self
            .lt
            .get_tsv_text(0)
            .map_err(|e| ScribeError::EngineFailure(format!("read word boxes: {e}")))?;
        let tokens = parse_tsv(&tsv);

        let text = match self.lt.get_utf8_text() {
            Ok(text) => text,
            Err(_) => join_tokens(&tokens),
        };

        Ok(EngineOutput { text, tokens })
    }
}

/// Builds [`TesseractEngine`]s from the OCR configuration.
#[derive(Debug, Clone)]
pub struct TesseractFactory {
    config: OcrConfig,
}

impl TesseractFactory {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for TesseractFactory {
    fn create(&self) -> Result<Box<dyn RecognitionEngine>> {
        let engine = TesseractEngine::new(&self.config)?;
        info!(languages = %self.config.languages.join("+"), "Tesseract engine initialized");
        Ok(Box::new(engine))
    }
}

/// Word-level tokens from Tesseract's TSV output.
///
/// Columns: level, page, block, paragraph, line, word, left, top, width,
/// height, conf, text. Only level 5 rows with a real confidence are words.
pub fn parse_tsv(tsv: &str) -> Vec<Token> {
    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(12, '\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let conf: f32 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if conf < 0.0 || text.is_empty() {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<u32>().ok();
            Some(Token {
                text: text.to_string(),
                confidence: (conf / 100.0).clamp(0.0, 1.0),
                bbox: BoundingBox {
                    x: num(6)?,
                    y: num(7)?,
                    width: num(8)?,
                    height: num(9)?,
                },
                block: num(2)?,
                line: num(4)?,
            })
        })
        .collect()
}

fn join_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut current: Option<(u32, u32)> = None;
    for token in tokens {
        let key = (token.block, token.line);
        match current {
            Some(prev) if prev == key => out.push(' '),
            Some(_) => out.push('\n'),
            None => {}
        }
        out.push_str(&token.text);
        current = Some(key);
    }
    out
}
