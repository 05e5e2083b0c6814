//! Fixed instruction templates sent to the reasoning and image models.

pub const REMOVE_TEXT_INSTRUCTION: &str = "Remove all visible text, letters, captions, watermarks and logos from [ref-1]. Fill the cleared areas so they blend seamlessly with the surrounding image. Keep everything else unchanged.";

pub const EXPAND_INSTRUCTION: &str = "The attached image has transparent padding around the original picture. Fill the padding seamlessly so it continues the scene naturally, matching lighting, perspective, colors and texture. Do not alter the original content.";

const QUOTE_CHARS: [char; 6] = ['"', '\'', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}'];

pub fn describe_instruction() -> &'static str {
    "Describe the attached image as a detailed prompt for an image generation model. Cover subject, setting, composition, lighting, color palette and artistic style. Output ONLY the prompt text, as a single paragraph, with no preamble."
}

pub fn caption_instruction(max_chars: u32) -> String {
    format!(
        "Write one short, catchy caption for the attached image (<= {max_chars} characters). Use the same language as any text already visible in the image; otherwise use English. No hashtags. No emojis. No quotes. Output ONLY the caption."
    )
}

pub fn enhance_instruction(prompt: &str) -> String {
    format!(
        "Rewrite the following image generation prompt so it is vivid and specific. Add concrete details about subject, setting, lighting, composition and mood while keeping the original intent. Output ONLY the improved prompt.\n\nPrompt: {prompt}"
    )
}

pub fn concept_instruction(prompt: &str) -> String {
    format!(
        "Turn the following idea into one original visual concept for a single image. Describe the scene, its focal point, the mood and a distinctive stylistic twist in 2-3 sentences. Output ONLY the concept.\n\nIdea: {prompt}"
    )
}

pub fn next_sentence_instruction(story: &str) -> String {
    if story.trim().is_empty() {
        return "Write the opening sentence of a short, imaginative story. Output ONLY that one sentence.".to_string();
    }
    format!(
        "Continue the following story with exactly one new sentence that follows naturally from the text. Keep the tone and tense consistent. Output ONLY the new sentence.\n\nStory:\n{story}"
    )
}

pub fn summarize_instruction(story: &str, max_chars: u32) -> String {
    format!(
        "Summarize the following story in at most {max_chars} characters. Keep the main characters and the key turn of events. Output ONLY the summary.\n\nStory:\n{story}"
    )
}

pub fn polish_instruction(story: &str) -> String {
    format!(
        "Polish the following story: fix grammar and spelling, improve flow and word choice, and keep the plot, voice and length roughly the same. Output ONLY the revised story.\n\nStory:\n{story}"
    )
}

pub fn translate_instruction(story: &str, language: &str) -> String {
    format!(
        "Translate the following story into {language}. Preserve meaning, tone and paragraph breaks. Output ONLY the translation.\n\nStory:\n{story}"
    )
}

pub fn design_from_story_instruction(story: &str) -> String {
    format!(
        "Read the following story and write one image generation prompt for a single illustration of its most striking moment. Describe the characters, setting, lighting, composition and art style. Output ONLY the prompt.\n\nStory:\n{story}"
    )
}

/// True when any character falls in the Thai Unicode block.
pub fn contains_thai(text: &str) -> bool {
    text.chars().any(|ch| ('\u{0E00}'..='\u{0E7F}').contains(&ch))
}

/// Image prompt that renders `caption` onto the first reference image.
pub fn caption_prompt(caption: &str) -> String {
    if contains_thai(caption) {
        return format!(
            "Add the following Thai text as a caption on [ref-1]: \"{caption}\". The Thai text MUST be rendered exactly as written, glyph for glyph, without translation or transliteration. Keep the rest of the image unchanged."
        );
    }
    format!(
        "Add the following text as a caption on [ref-1]: \"{caption}\". Render the text exactly as written. Keep the rest of the image unchanged."
    )
}

/// Drops quotation marks around and inside a caption. Apostrophes between
/// two letters or digits (`it's`, `rock'n'roll`) are kept.
pub fn strip_caption_quotes(text: &str) -> String {
    let chars = text.trim().chars().collect::<Vec<char>>();
    let mut out = String::with_capacity(text.len());
    for (idx, ch) in chars.iter().copied().enumerate() {
        if !QUOTE_CHARS.contains(&ch) {
            out.push(ch);
            continue;
        }
        let apostrophe = matches!(ch, '\'' | '\u{2019}');
        let inside_word = idx > 0
            && chars[idx - 1].is_alphanumeric()
            && chars.get(idx + 1).is_some_and(|next| next.is_alphanumeric());
        if apostrophe && inside_word {
            out.push(ch);
        }
    }
    out.trim().to_string()
}

pub fn clean_text_inference(text: &str) -> String {
    let cleaned = text.trim();
    let unfenced = cleaned
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
        .map(|inner| match inner.split_once('\n') {
            Some((lang, body)) if lang.chars().all(|ch| ch.is_ascii_alphanumeric()) => body,
            _ => inner,
        })
        .unwrap_or(cleaned);
    unfenced.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thai_caption_demands_verbatim_glyphs() {
        let prompt = caption_prompt("สวัสดี");
        assert!(prompt.contains("Thai text"));
        assert!(prompt.contains("MUST be rendered exactly"));
        assert!(prompt.contains("without translation"));
        assert!(prompt.contains("\"สวัสดี\""));
    }

    #[test]
    fn non_thai_caption_uses_generic_wording() {
        let prompt = caption_prompt("Hello world");
        assert!(!prompt.contains("Thai"));
        assert!(prompt.contains("Add the following text as a caption on [ref-1]: \"Hello world\""));
    }

    #[test]
    fn thai_detection_is_block_based() {
        assert!(contains_thai("Hello ก"));
        assert!(!contains_thai("こんにちは"));
        assert!(!contains_thai(""));
    }

    #[test]
    fn caption_quotes_are_stripped() {
        assert_eq!(strip_caption_quotes("  \"Sunset over Bangkok\" "), "Sunset over Bangkok");
        assert_eq!(
            strip_caption_quotes("\u{201C}It\u{2019}s late\u{201D}"),
            "It\u{2019}s late"
        );
        assert_eq!(strip_caption_quotes("'Rock'n'roll night'"), "Rock'n'roll night");
        assert_eq!(strip_caption_quotes("the 'old' pier"), "the old pier");
        assert_eq!(strip_caption_quotes("\"ตลาดน้ำ\""), "ตลาดน้ำ");
    }

    #[test]
    fn length_hints_are_embedded() {
        assert!(caption_instruction(42).contains("<= 42 characters"));
        assert!(summarize_instruction("Once upon a time.", 80).contains("at most 80 characters"));
    }

    #[test]
    fn empty_story_asks_for_an_opening_line() {
        assert!(next_sentence_instruction("   ").contains("opening sentence"));
        assert!(next_sentence_instruction("A fox woke up.").contains("A fox woke up."));
    }

    #[test]
    fn clean_text_inference_drops_code_fences() {
        assert_eq!(clean_text_inference("```text\nA red fox.\n```"), "A red fox.");
        assert_eq!(clean_text_inference("  plain  "), "plain");
    }
}
