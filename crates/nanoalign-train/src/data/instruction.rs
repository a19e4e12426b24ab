//! Instruction/response data, preference pairs, and their tokenized form.

use nanoalign_core::{AlignError, Result};
use serde::{Deserialize, Serialize};

use super::dataset::{Dataset, Example};
use super::tokenizer::{PairEncoding, TextTokenizer};

pub const DEMO_INSTRUCTION: &str = "Predict the following English: 'Hello, how are'";
pub const DEMO_RESPONSE: &str = "you'";
pub const DEMO_REJECTED: &str = "monkey";

/// Column-oriented instruction/response table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionDataset {
    pub instructions: Vec<String>,
    pub responses: Vec<String>,
}

impl InstructionDataset {
    /// Build from columns; lengths must match.
    pub fn from_columns(instructions: Vec<String>, responses: Vec<String>) -> Result<Self> {
        if instructions.len() != responses.len() {
            return Err(AlignError::DatasetMismatch {
                column: "response".into(),
                expected: instructions.len(),
                actual: responses.len(),
            });
        }
        Ok(Self {
            instructions,
            responses,
        })
    }

    /// The single demo row.
    pub fn demo() -> Self {
        Self {
            instructions: vec![DEMO_INSTRUCTION.into()],
            responses: vec![DEMO_RESPONSE.into()],
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&str, &str)> {
        self.instructions
            .iter()
            .zip(&self.responses)
            .map(|(i, r)| (i.as_str(), r.as_str()))
    }
}

/// One pairwise comparison for reward-model training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencePair {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

impl PreferencePair {
    pub fn demo() -> Self {
        Self {
            prompt: DEMO_INSTRUCTION.into(),
            chosen: DEMO_RESPONSE.into(),
            rejected: DEMO_REJECTED.into(),
        }
    }
}

/// Fixed-length encodings of an [`InstructionDataset`].
#[derive(Debug, Clone)]
pub struct TokenizedDataset {
    encodings: Vec<PairEncoding>,
    max_length: usize,
    mask_prompt: bool,
}

impl TokenizedDataset {
    /// Encode every row with truncation and max-length padding.
    pub fn map(
        dataset: &InstructionDataset,
        tokenizer: &TextTokenizer,
        max_length: usize,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(AlignError::EmptyDataset("no instruction rows".into()));
        }
        if max_length < 2 {
            return Err(AlignError::InvalidConfig(format!(
                "max_length ({}) must be >= 2",
                max_length
            )));
        }
        let encodings = dataset
            .rows()
            .map(|(instruction, response)| tokenizer.encode_pair(instruction, response, max_length))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            encodings,
            max_length,
            mask_prompt: false,
        })
    }

    /// Exclude instruction tokens from the loss.
    pub fn with_prompt_masking(mut self, mask_prompt: bool) -> Self {
        self.mask_prompt = mask_prompt;
        self
    }

    pub fn encodings(&self) -> &[PairEncoding] {
        &self.encodings
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Dataset for TokenizedDataset {
    fn len(&self) -> usize {
        self.encodings.len()
    }

    fn get_item(&self, idx: usize) -> Example {
        let enc = &self.encodings[idx];
        let n = enc.input_ids.len() - 1;
        let loss_mask = (1..=n)
            .map(|pos| {
                let real = enc.attention_mask[pos] == 1;
                let in_prompt = self.mask_prompt && pos < enc.prompt_len;
                if real && !in_prompt {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        Example {
            input_ids: enc.input_ids[..n].to_vec(),
            target_ids: enc.input_ids[1..].to_vec(),
            loss_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatched_columns_rejected() {
        let err = InstructionDataset::from_columns(
            vec![DEMO_INSTRUCTION.into()],
            vec![DEMO_RESPONSE.into(), DEMO_REJECTED.into()],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AlignError::DatasetMismatch {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_demo_splits_literal_content() {
        let ds = InstructionDataset::demo();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.responses[0], "you'");

        let pair = PreferencePair::demo();
        assert_eq!(pair.prompt, ds.instructions[0]);
        assert_eq!(pair.chosen, "you'");
        assert_eq!(pair.rejected, "monkey");
    }

    #[test]
    fn test_targets_shift_and_padding_masked() {
        let tok = TextTokenizer::byte_level().unwrap();
        let ds = InstructionDataset::from_columns(vec!["ab".into()], vec!["c".into()]).unwrap();
        let tokenized = TokenizedDataset::map(&ds, &tok, 8).unwrap();
        let ex = tokenized.get_item(0);

        // ids: a b c eos pad pad pad pad
        assert_eq!(ex.input_ids.len(), 7);
        assert_eq!(ex.input_ids[..3], [97, 98, 99]);
        assert_eq!(ex.target_ids[..3], [98, 99, tok.eos_id()]);
        assert_eq!(ex.loss_mask, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_prompt_masking() {
        let tok = TextTokenizer::byte_level().unwrap();
        let ds = InstructionDataset::from_columns(vec!["ab".into()], vec!["c".into()]).unwrap();
        let tokenized = TokenizedDataset::map(&ds, &tok, 8)
            .unwrap()
            .with_prompt_masking(true);
        let ex = tokenized.get_item(0);
        // only "c" and eos are predicted
        assert_eq!(ex.loss_mask[..4], [0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let tok = TextTokenizer::byte_level().unwrap();
        let ds = InstructionDataset::default();
        assert!(matches!(
            TokenizedDataset::map(&ds, &tok, 16),
            Err(AlignError::EmptyDataset(_))
        ));
    }
}
