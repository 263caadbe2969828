use std::collections::BTreeSet;

use tokenizers::{
    normalizers::bert::BertNormalizer, pre_tokenizers::bert::BertPreTokenizer, NormalizedString,
    Normalizer, OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer,
};

use crate::error::AppError;

/// Lexical terms of `text`: BERT-normalized (lowercased, accents stripped) and
/// split on whitespace and punctuation. Punctuation-only pieces are dropped.
pub fn tokenize(text: &str) -> Result<Vec<String>, AppError> {
    let mut normalized = NormalizedString::from(text);
    BertNormalizer::default()
        .normalize(&mut normalized)
        .map_err(|e| AppError::InternalError(format!("failed to normalize text: {e}")))?;

    let mut pretokenized = PreTokenizedString::from(normalized);
    BertPreTokenizer
        .pre_tokenize(&mut pretokenized)
        .map_err(|e| AppError::InternalError(format!("failed to pre-tokenize text: {e}")))?;

    Ok(pretokenized
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(piece, _, _)| piece)
        .filter(|piece| piece.chars().any(char::is_alphanumeric))
        .map(str::to_string)
        .collect())
}

pub fn term_set(text: &str) -> Result<BTreeSet<String>, AppError> {
    Ok(tokenize(text)?.into_iter().collect())
}
