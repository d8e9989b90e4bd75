//! Prompt templates shared by the generative backends, and lenient
//! location of a JSON object inside free-form model output.

/// Extraction prompt for a single review.
pub fn extraction_prompt(review_text: &str) -> String {
    format!(
        r#"Analyze the following user review and extract key entities and their relationships.
The entities to extract are:
- FEATURE_REQUEST: A specific feature the user is asking for.
- BUG_REPORT: An issue or bug the user is reporting.
- USER_SENTIMENT: The overall sentiment of the review (e.g., "Positive", "Negative", "Mixed", "Neutral").
- PRODUCT_COMPONENT: A specific part of the app mentioned (e.g., "UI", "Playlist", "Search", "Login").

Return the output as a JSON object with two keys: "entities" and "relationships".
Example:
Review: "The new update is terrible. The app crashes every time I open my playlist. I wish there was a dark mode."
Output:
{{
  "entities": [
    {{"id": "app_crash", "type": "BUG_REPORT", "value": "Playlist crash"}},
    {{"id": "playlist", "type": "PRODUCT_COMPONENT", "value": "Playlist"}},
    {{"id": "dark_mode_request", "type": "FEATURE_REQUEST", "value": "Dark mode"}},
    {{"id": "negative_sentiment", "type": "USER_SENTIMENT", "value": "Negative"}}
  ],
  "relationships": [
    {{"source": "app_crash", "target": "playlist", "type": "related_to"}},
    {{"source": "negative_sentiment", "target": "app_crash", "type": "describes"}},
    {{"source": "negative_sentiment", "target": "dark_mode_request", "type": "describes"}}
  ]
}}

Use short, reusable names for "value" so the same issue reported by different users gets the same name.
Only relate entities that this review itself connects.

Now, analyze this review:
---
{review_text}
---
"#
    )
}

/// Summary prompt for one community. `entity_lines` and `relation_lines`
/// are already bounded by the caller.
pub fn summary_prompt(entity_lines: &[String], relation_lines: &[String]) -> String {
    let mut prompt = String::from(
        "The following is a list of entities and concepts belonging to a single community \
         detected within a knowledge graph of app reviews.\n\
         Summarize the main theme or topic of this community in a single, concise sentence.\n\n\
         Entities:\n",
    );
    for line in entity_lines {
        prompt.push_str(line);
        prompt.push('\n');
    }
    if !relation_lines.is_empty() {
        prompt.push_str("\nRelationships:\n");
        for line in relation_lines {
            prompt.push_str(line);
            prompt.push('\n');
        }
    }
    prompt.push_str("\nSummary:\n");
    prompt
}

/// Answer prompt wrapping the assembled query context.
pub fn answer_prompt(context: &str, question: &str) -> String {
    format!(
        r#"You are an AI assistant for a product manager. Your task is to answer questions based on a knowledge graph built from user reviews.
Use the provided context, which includes global summaries, local entity relationships, and original review text, to synthesize a comprehensive and actionable answer.
Do not mention the internal mechanics (e.g., "based on the community summary"). Answer the question directly and professionally.

{context}
---

USER'S QUESTION:
"{question}"

ANSWER:
"#
    )
}

/// Find the JSON object in model output: a fenced ```json block if present,
/// otherwise the span from the first `{` to the last `}`.
pub fn locate_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if candidate.starts_with('{') {
                return Some(candidate);
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}
