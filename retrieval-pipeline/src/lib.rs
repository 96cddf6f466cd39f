pub mod corpus;
pub mod ranking;

pub use corpus::{default_corpus_texts, load_corpus_texts, Corpus, CorpusEntry};
pub use ranking::{cosine_similarity, l2_norm, rank, RankedResult};
