pub mod circuit_breaker;
pub mod embeddings;
pub mod llm;
pub mod vector_store;

pub use circuit_breaker::CircuitBreaker;
pub use embeddings::HttpEmbeddingGateway;
pub use llm::{HttpLlmGateway, PipelineSummarizer};
pub use vector_store::HttpVectorStoreGateway;
