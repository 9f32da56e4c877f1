pub mod classifier;
pub mod embedding;
pub mod llm_providers;
pub mod matcher;
pub mod testing;
pub mod tokenizer;
pub mod vector_store;

pub use classifier::{classify_as, is_affirmative, Classifier, ClassifyRequest};
pub use embedding::{cosine_similarity, Embedder, HashingEmbedder, OllamaEmbedder};
pub use llm_providers::{OllamaProvider, OpenAIProvider};
pub use matcher::{IoQuery, MatchCandidate, MatchOutcome, SemanticMatcher};
pub use testing::ScriptedClassifier;
pub use tokenizer::{clean_io_name, get_tokens, unique_tokens};
pub use vector_store::{Filter, Payload, ScoredPoint, ScrollPage, SqliteVectorStore, VectorPoint, VectorStore};
