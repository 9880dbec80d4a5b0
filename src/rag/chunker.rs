//! Chunking of seed knowledge documents.
//!
//! Splits Markdown by section headings first, then groups sentences inside
//! oversized sections. Chunk boundaries never cut a sentence; tiny
//! trailing chunks merge into their predecessor so the index never carries
//! fragments too short to embed meaningfully.

/// One chunk ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeChunk {
    pub content: String,
    pub chunk_index: usize,
    pub section_title: Option<String>,
}

pub struct SentenceChunker {
    max_chunk_chars: usize,
    min_chunk_chars: usize,
    /// Sentences per group when a section needs splitting.
    sentences_per_group: usize,
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self {
            max_chunk_chars: 1000,
            min_chunk_chars: 40,
            sentences_per_group: 4,
        }
    }

    pub fn chunk(&self, markdown: &str) -> Vec<KnowledgeChunk> {
        let mut chunks = Vec::new();
        let mut chunk_index = 0;

        for section in split_by_headings(markdown) {
            if section.content.len() <= self.max_chunk_chars {
                chunks.push(KnowledgeChunk {
                    content: section.content,
                    chunk_index,
                    section_title: section.title,
                });
                chunk_index += 1;
            } else {
                for group in group_sentences(&section.content, self.sentences_per_group) {
                    chunks.push(KnowledgeChunk {
                        content: group,
                        chunk_index,
                        section_title: section.title.clone(),
                    });
                    chunk_index += 1;
                }
            }
        }

        merge_tiny_chunks(&mut chunks, self.min_chunk_chars);
        chunks
    }
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::new()
    }
}

struct Section {
    title: Option<String>,
    content: String,
}

fn split_by_headings(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_title: Option<String> = None;
    let mut current_content = String::new();

    for line in markdown.lines() {
        if line.starts_with("# ") || line.starts_with("## ") || line.starts_with("### ") {
            if !current_content.trim().is_empty() {
                sections.push(Section {
                    title: current_title.take(),
                    content: current_content.trim().to_string(),
                });
            }
            current_title = Some(line.trim_start_matches('#').trim().to_string());
            current_content = String::new();
        } else {
            current_content.push_str(line);
            current_content.push('\n');
        }
    }

    if !current_content.trim().is_empty() {
        sections.push(Section {
            title: current_title,
            content: current_content.trim().to_string(),
        });
    }

    sections
}

/// Split into sentences and regroup `per_group` at a time.
fn group_sentences(text: &str, per_group: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    sentences
        .chunks(per_group.max(1))
        .map(|group| group.join(" "))
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Sentence boundaries: terminator followed by whitespace. Keeps the
/// terminator with its sentence. Decimal points and abbreviations survive
/// because a digit or lowercase letter follows them without whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if chars.peek().map_or(true, |next| next.is_whitespace()) {
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current = String::new();
            }
        }
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Fold chunks below `min_chars` into their predecessor.
fn merge_tiny_chunks(chunks: &mut Vec<KnowledgeChunk>, min_chars: usize) {
    let mut i = 1;
    while i < chunks.len() {
        if chunks[i].content.len() < min_chars {
            let tiny = chunks.remove(i);
            let prev = &mut chunks[i - 1];
            prev.content.push_str("\n\n");
            prev.content.push_str(&tiny.content);
        } else {
            i += 1;
        }
    }
    for (index, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_index = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_section_is_one_chunk() {
        let chunker = SentenceChunker::new();
        let chunks = chunker.chunk(
            "## Anaesthesia\nArticaine 4% with adrenaline is standard for mandibular blocks.",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section_title.as_deref(), Some("Anaesthesia"));
        assert!(chunks[0].content.contains("Articaine"));
    }

    #[test]
    fn headings_produce_separate_chunks() {
        let chunker = SentenceChunker::new();
        let md = "## Caries\nCaries management by risk assessment is recommended.\n\n\
                  ## Periodontitis\nStaging follows the 2018 classification system.";
        let chunks = chunker.chunk(md);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section_title.as_deref(), Some("Caries"));
        assert_eq!(chunks[1].section_title.as_deref(), Some("Periodontitis"));
    }

    #[test]
    fn long_section_splits_into_sentence_groups() {
        let chunker = SentenceChunker::new();
        let sentence = "This sentence pads the section to force sentence grouping. ";
        let md = format!("## Long\n{}", sentence.repeat(40));
        let chunks = chunker.chunk(&md);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.section_title.as_deref(), Some("Long"));
            // Groups never cut a sentence.
            assert!(chunk.content.trim_end().ends_with('.'));
        }
    }

    #[test]
    fn chunk_indices_are_sequential() {
        let chunker = SentenceChunker::new();
        let sentence = "Another sentence to pad out this clinical section nicely. ";
        let md = format!(
            "## A\n{}\n## B\nShort section that stays whole and unsplit.",
            sentence.repeat(40)
        );
        let chunks = chunker.chunk(&md);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn tiny_chunks_merge_into_predecessor() {
        let chunker = SentenceChunker::new();
        let md = "## Main\nA full-length paragraph about endodontic retreatment protocols.\n\n## Stub\nOk.";
        let chunks = chunker.chunk(md);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("Ok."));
    }

    #[test]
    fn decimal_points_do_not_split_sentences() {
        let sentences = split_sentences("Administer 0.5 ml of solution. Observe the patient.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "Administer 0.5 ml of solution.");
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = SentenceChunker::new();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\n  ").is_empty());
    }
}
