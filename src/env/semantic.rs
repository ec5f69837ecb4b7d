//! 页面语义检索：正文分块 → 嵌入 → 余弦相似度 top-k
//!
//! 嵌入不可用或调用失败时退化为原始正文截断，保证 Search 动作总有结果可读。

use std::sync::Arc;

use crate::llm::embedding::cosine;
use crate::llm::EmbeddingProvider;

const DEFAULT_CHUNK_CHARS: usize = 600;
const DEFAULT_FALLBACK_CHARS: usize = 2000;

pub struct SemanticIndex {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    chunk_chars: usize,
    fallback_chars: usize,
}

impl SemanticIndex {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            embedder,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            fallback_chars: DEFAULT_FALLBACK_CHARS,
        }
    }

    pub fn with_fallback_chars(mut self, chars: usize) -> Self {
        self.fallback_chars = chars;
        self
    }

    /// 按段落切块，相邻短段合并到 chunk_chars 左右
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for para in text.split('\n').map(str::trim).filter(|p| !p.is_empty()) {
            if !current.is_empty() && current.chars().count() + para.chars().count() > self.chunk_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(para);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    pub async fn search(&self, text: &str, query: &str, k: usize) -> Vec<String> {
        if let Some(embedder) = &self.embedder {
            match self.rank(embedder.as_ref(), text, query, k).await {
                Ok(spans) if !spans.is_empty() => return spans,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "semantic search failed, falling back to raw text"),
            }
        }
        self.fallback(text)
    }

    async fn rank(
        &self,
        embedder: &dyn EmbeddingProvider,
        text: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, String> {
        let chunks = self.chunk(text);
        if chunks.is_empty() {
            return Ok(vec![]);
        }
        let mut inputs = Vec::with_capacity(chunks.len() + 1);
        inputs.push(query.to_string());
        inputs.extend(chunks.iter().cloned());
        let vectors = embedder.embed(&inputs).await?;
        let (query_vec, chunk_vecs) = vectors
            .split_first()
            .ok_or_else(|| "empty embedding response".to_string())?;

        let mut scored: Vec<(f32, &String)> = chunk_vecs
            .iter()
            .zip(chunks.iter())
            .map(|(v, c)| (cosine(query_vec, v), c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(k.max(1)).map(|(_, c)| c.clone()).collect())
    }

    fn fallback(&self, text: &str) -> Vec<String> {
        let raw: String = text.chars().take(self.fallback_chars).collect();
        if raw.trim().is_empty() {
            vec![]
        } else {
            vec![raw]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// 以「是否包含 price」作为唯一维度的假嵌入
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Ok(texts
                .iter()
                .map(|t| {
                    let hit = if t.to_lowercase().contains("price") { 1.0 } else { 0.0 };
                    vec![hit, 1.0 - hit]
                })
                .collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Err("401 unauthorized".into())
        }
    }

    #[tokio::test]
    async fn test_ranks_relevant_chunk_first() {
        let index = SemanticIndex {
            embedder: Some(Arc::new(KeywordEmbedder)),
            chunk_chars: 20,
            fallback_chars: 100,
        };
        let text = "Welcome to the shop\n\nShipping takes three days\n\nThe price is 20 EUR";
        let spans = index.search(text, "what is the price", 1).await;
        assert_eq!(spans, vec!["The price is 20 EUR".to_string()]);
    }

    #[tokio::test]
    async fn test_falls_back_to_truncated_text() {
        let index = SemanticIndex::new(Some(Arc::new(BrokenEmbedder))).with_fallback_chars(5);
        let spans = index.search("abcdefghij", "anything", 3).await;
        assert_eq!(spans, vec!["abcde".to_string()]);
    }
}
