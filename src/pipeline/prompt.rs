//! Prompt assembly for SmartNote generation.

use crate::rag::Passage;

pub const SMARTNOTE_SYSTEM_PROMPT: &str = r#"You are a clinical documentation assistant for a dental practice. You turn raw consultation transcriptions into structured SmartNotes for the treating dentist.

RULES:
1. Use ONLY information present in the transcription and, when provided, the REFERENCE section.
2. Never invent findings, diagnoses, tooth numbers, or dosages that are not stated.
3. Keep the patient's own words for subjective complaints; translate clinical observations into standard terminology.
4. Use FDI tooth numbering as given in the transcription.
5. If information for a section is absent, write "Not recorded".

OUTPUT FORMAT (Markdown):
## Motif de consultation
## Anamnèse
## Examen clinique
## Diagnostic
## Traitement réalisé
## Plan de traitement
## Recommandations"#;

/// Build the user prompt for a plain (non-RAG) generation.
pub fn build_plain_prompt(transcription: &str) -> String {
    format!("TRANSCRIPTION:\n{transcription}\n\nProduce the SmartNote now.")
}

/// Build the RAG-augmented prompt: retrieved passages go first, under a
/// clearly delimited REFERENCE section the system prompt points at.
pub fn build_rag_prompt(transcription: &str, passages: &[Passage]) -> String {
    let mut prompt = String::new();
    prompt.push_str("<REFERENCE>\n");
    for (i, passage) in passages.iter().enumerate() {
        match &passage.section_title {
            Some(title) => prompt.push_str(&format!("[{n}] ({title})\n", n = i + 1)),
            None => prompt.push_str(&format!("[{n}]\n", n = i + 1)),
        }
        prompt.push_str(passage.content.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("</REFERENCE>\n\n");
    prompt.push_str(&build_plain_prompt(transcription));
    prompt
}
