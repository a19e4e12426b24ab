//! Tokenizer wrapper around the HuggingFace `tokenizers` crate.
//!
//! GPT-2 style vocabularies carry no pad token, so padding reuses eos.

use std::path::Path;

use nanoalign_core::{AlignError, IoResultExt, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const EOS_TOKEN: &str = "<|endoftext|>";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Special-token ids persisted next to `tokenizer.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub eos_token: String,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
}

/// A prompt/response pair encoded to a fixed length.
#[derive(Debug, Clone, PartialEq)]
pub struct PairEncoding {
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<u32>,
    /// Number of leading tokens that belong to the instruction.
    pub prompt_len: usize,
}

impl PairEncoding {
    /// Count of non-pad tokens.
    pub fn len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct TextTokenizer {
    inner: tokenizers::Tokenizer,
    special: SpecialTokens,
    pub vocab_size: usize,
}

impl TextTokenizer {
    /// Byte-level BPE without merges: one token per byte plus `<|endoftext|>` (id 256).
    pub fn byte_level() -> Result<Self> {
        let definition = byte_level_definition();
        let inner = tokenizers::Tokenizer::from_bytes(definition.to_string().as_bytes())
            .map_err(|e| AlignError::Tokenization(format!("byte-level tokenizer: {}", e)))?;
        Self::with_eos(inner, "<builtin>")
    }

    /// Load a `tokenizer.json`, locating eos by its GPT-2 name.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            AlignError::TokenizerUnavailable {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::with_eos(inner, &path.display().to_string())
    }

    /// Load `tokenizer.json` (+ `tokenizer_config.json` when present) from a directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let file = dir.join(TOKENIZER_FILE);
        if !file.is_file() {
            return Err(AlignError::TokenizerUnavailable {
                path: dir.display().to_string(),
                reason: format!("missing {}", TOKENIZER_FILE),
            });
        }
        let mut tokenizer = Self::from_file(&file)?;

        let config_path = dir.join(TOKENIZER_CONFIG_FILE);
        if config_path.is_file() {
            let text = std::fs::read_to_string(&config_path).with_path(&config_path)?;
            let special: SpecialTokens = serde_json::from_str(&text)?;
            if special.eos_token_id as usize >= tokenizer.vocab_size
                || special.pad_token_id as usize >= tokenizer.vocab_size
            {
                return Err(AlignError::TokenizerUnavailable {
                    path: config_path.display().to_string(),
                    reason: "special token id outside vocabulary".into(),
                });
            }
            tokenizer.special = special;
        }
        Ok(tokenizer)
    }

    fn with_eos(inner: tokenizers::Tokenizer, origin: &str) -> Result<Self> {
        let eos = inner
            .token_to_id(EOS_TOKEN)
            .ok_or_else(|| AlignError::TokenizerUnavailable {
                path: origin.to_string(),
                reason: format!("vocabulary has no {} token", EOS_TOKEN),
            })?;
        let vocab_size = inner.get_vocab_size(true);
        Ok(Self {
            inner,
            special: SpecialTokens {
                eos_token: EOS_TOKEN.to_string(),
                eos_token_id: eos,
                pad_token_id: eos,
            },
            vocab_size,
        })
    }

    /// Write `tokenizer.json` and `tokenizer_config.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_path(dir)?;
        let file = dir.join(TOKENIZER_FILE);
        self.inner
            .save(&file, false)
            .map_err(|e| nanoalign_core::error::save_error(e, &file))?;
        let config_path = dir.join(TOKENIZER_CONFIG_FILE);
        let text = serde_json::to_string_pretty(&self.special)?;
        std::fs::write(&config_path, text).with_path(&config_path)?;
        Ok(())
    }

    pub fn eos_id(&self) -> u32 {
        self.special.eos_token_id
    }

    pub fn pad_id(&self) -> u32 {
        self.special.pad_token_id
    }

    pub fn set_pad_id(&mut self, id: u32) {
        self.special.pad_token_id = id;
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| AlignError::Tokenization(format!("encoding error: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| AlignError::Tokenization(format!("decoding error: {}", e)))
    }

    /// instruction ++ response ++ eos, truncated and right-padded to `max_length`.
    pub fn encode_pair(
        &self,
        instruction: &str,
        response: &str,
        max_length: usize,
    ) -> Result<PairEncoding> {
        if max_length == 0 {
            return Err(AlignError::InvalidConfig("max_length must be > 0".into()));
        }
        let mut ids = self.encode(instruction)?;
        let prompt_len = ids.len().min(max_length);
        ids.extend(self.encode(response)?);
        ids.push(self.eos_id());
        ids.truncate(max_length);

        let real = ids.len();
        let mut attention_mask = vec![1u32; real];
        ids.resize(max_length, self.pad_id());
        attention_mask.resize(max_length, 0);

        Ok(PairEncoding {
            input_ids: ids,
            attention_mask,
            prompt_len,
        })
    }
}

/// GPT-2 printable-character mapping for each byte.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let printable = |b: u32| {
        (u32::from('!')..=u32::from('~')).contains(&b)
            || (u32::from('¡')..=u32::from('¬')).contains(&b)
            || (u32::from('®')..=u32::from('ÿ')).contains(&b)
    };
    let mut shifted = 0u32;
    (0u32..256)
        .map(|b| {
            let code = if printable(b) {
                b
            } else {
                shifted += 1;
                255 + shifted
            };
            (b as u8, char::from_u32(code).unwrap_or('?'))
        })
        .collect()
}

fn byte_level_definition() -> Value {
    let mut vocab = Map::new();
    for (byte, ch) in bytes_to_unicode() {
        vocab.insert(ch.to_string(), json!(byte));
    }
    vocab.insert(EOS_TOKEN.to_string(), json!(256));

    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 256,
            "content": EOS_TOKEN,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": {
            "type": "ByteLevel",
            "add_prefix_space": false,
            "trim_offsets": true,
            "use_regex": true
        },
        "post_processor": null,
        "decoder": {
            "type": "ByteLevel",
            "add_prefix_space": false,
            "trim_offsets": true,
            "use_regex": true
        },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "ignore_merges": false,
            "vocab": vocab,
            "merges": []
        }
    })
}
