//! Prompt template for grounded answers.
//!
//! The layout is consumed verbatim by the chat template the GGUF models were
//! tuned on; keep it byte-for-byte stable.
use crate::store::Document;

const SYSTEM_PROMPT: &str =
    "You are the Memex, a helpful assistant that answers queries in brief summaries.";

/// Builds the role-delimited prompt from retrieved documents and a question.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    /// Per-document content cap in characters.
    max_document_chars: Option<usize>,
}

impl PromptBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_document_chars(mut self, limit: Option<usize>) -> Self {
        self.max_document_chars = limit;
        self
    }

    /// "Document i" blocks, 1-based, in retrieval order.
    pub fn context_block(&self, documents: &[Document]) -> String {
        let mut context = String::new();
        for (i, doc) in documents.iter().enumerate() {
            context.push_str(&format!("Document {}:\nTitle: {}\n", i + 1, doc.title));
            context.push_str(&format!("Content: {}\n\n", self.truncate(&doc.content)));
        }
        context
    }

    pub fn build(&self, documents: &[Document], query: &str) -> String {
        let context = self.context_block(documents);
        format!(
            "<|system|>{SYSTEM_PROMPT}<|end|>
        <|user|>Based on the following information:

{context}

Answer this question: {query}<|end|>

<|assistant|>Answer:"
        )
    }

    fn truncate<'a>(&self, content: &'a str) -> &'a str {
        match self.max_document_chars {
            Some(limit) => match content.char_indices().nth(limit) {
                Some((cut, _)) => &content[..cut],
                None => content,
            },
            None => content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, content: &str) -> Document {
        Document {
            id: "id".to_string(),
            title: title.to_string(),
            content: content.to_string(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_exact_template() {
        let prompt = PromptBuilder::new().build(
            &[doc("Note A", "apples"), doc("Note C", "apples and oranges")],
            "what fruit?",
        );
        let expected = "<|system|>You are the Memex, a helpful assistant that answers queries in brief summaries.<|end|>\n        <|user|>Based on the following information:\n\nDocument 1:\nTitle: Note A\nContent: apples\n\nDocument 2:\nTitle: Note C\nContent: apples and oranges\n\n\n\nAnswer this question: what fruit?<|end|>\n\n<|assistant|>Answer:";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn test_empty_context() {
        let prompt = PromptBuilder::new().build(&[], "hello");
        assert!(prompt.contains("information:\n\n\n\nAnswer this question: hello<|end|>"));
        assert!(prompt.ends_with("<|assistant|>Answer:"));
    }

    #[test]
    fn test_empty_title_kept_verbatim() {
        let block = PromptBuilder::new().context_block(&[doc("", "body")]);
        assert_eq!(block, "Document 1:\nTitle: \nContent: body\n\n");
    }

    #[test]
    fn test_truncation_on_char_boundary() {
        let builder = PromptBuilder::new().with_max_document_chars(Some(3));
        let block = builder.context_block(&[doc("t", "héllo")]);
        assert_eq!(block, "Document 1:\nTitle: t\nContent: hél\n\n");

        let short = builder.context_block(&[doc("t", "ab")]);
        assert!(short.contains("Content: ab\n"));
    }
}
