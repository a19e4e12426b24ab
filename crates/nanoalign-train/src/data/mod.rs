pub mod dataset;
pub mod instruction;
pub mod tokenizer;

pub use dataset::{Batch, DataLoader, Dataset, Example};
pub use instruction::{InstructionDataset, PreferencePair, TokenizedDataset};
pub use tokenizer::{PairEncoding, SpecialTokens, TextTokenizer};
